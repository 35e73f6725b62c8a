use sha3::{Digest, Sha3_256};

/// SHA3-256 digest of `data`.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha3_256::new();
    h.update(data);
    h.finalize().into()
}

/// Device fingerprint: SHA3-256 over the concatenation of both public keys
/// and their scheme tags. Stable identifier for UIs.
pub fn fingerprint(
    sign_scheme: &str,
    sign_pub: &[u8],
    crypt_scheme: &str,
    crypt_pub: &[u8],
) -> Vec<u8> {
    let mut h = Sha3_256::new();
    h.update(sign_scheme.as_bytes());
    h.update(sign_pub);
    h.update(crypt_scheme.as_bytes());
    h.update(crypt_pub);
    h.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_with_any_component() {
        let base = fingerprint("A", b"k1", "B", b"k2");
        assert_ne!(base, fingerprint("X", b"k1", "B", b"k2"));
        assert_ne!(base, fingerprint("A", b"xx", "B", b"k2"));
        assert_ne!(base, fingerprint("A", b"k1", "X", b"k2"));
        assert_ne!(base, fingerprint("A", b"k1", "B", b"xx"));
        assert_eq!(base, fingerprint("A", b"k1", "B", b"k2"));
        assert_eq!(base.len(), 32);
    }
}
