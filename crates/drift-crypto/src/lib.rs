//! Cryptographic primitives for the driftsync client core.
//!
//! Everything in this crate is pure computation: no I/O, no async, no
//! protocol state. Scheme identifiers travel as UTF-8 strings of the
//! canonical algorithm name so key blobs and their schemes can be validated
//! independently of each other.

#![forbid(unsafe_code)]

pub mod asym;
pub mod error;
pub mod export;
pub mod hash;
pub mod mac;
pub mod rng;
pub mod secret;

pub use error::CryptoError;
