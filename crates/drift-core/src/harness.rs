//! Test harness for the connector.
//!
//! Provides a scripted in-memory transport so tests can play the server
//! side of the protocol frame by frame, plus event-stream helpers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use drift_proto::messages::{encode_message, WireMessage, PING_FRAME};
use drift_proto::{decode_frame, Frame};

use crate::config::{Defaults, RemoteConfig};
use crate::connector::{ConnectorHandle, RemoteConnector};
use crate::errors::{KeystoreError, TransportError};
use crate::events::SyncEvent;
use crate::keystore::{Keystore, MemoryKeystore, SealedKey};
use crate::settings::Settings;
use crate::transport::{Transport, TransportFactory};

// All scripted tests run with a paused clock; waits auto-advance through
// the keepalive (minutes) and proof (10 min) timers instead of sleeping.
const WAIT: Duration = Duration::from_secs(3600);

/// Client side of a scripted connection.
pub struct ScriptedTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// Server side of a scripted connection. Dropping it disconnects the
/// client.
pub struct ServerEnd {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ServerEnd {
    /// Send a typed frame to the client.
    pub fn send<M: WireMessage>(&self, message: &M) {
        let frame = encode_message(message).expect("encodable test message");
        let _ = self.tx.send(frame);
    }

    pub fn send_raw(&self, frame: &[u8]) {
        let _ = self.tx.send(Bytes::copy_from_slice(frame));
    }

    /// Next raw frame from the client (including pings).
    pub async fn recv_raw(&mut self) -> Bytes {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection")
    }

    /// Next decoded message from the client, skipping keepalive pings.
    pub async fn next_message(&mut self) -> Frame {
        self.next_message_raw().await.0
    }

    /// Like [`next_message`](Self::next_message), but also returns the raw
    /// frame bytes so trailing signatures can be verified against the
    /// signed prefix.
    pub async fn next_message_raw(&mut self) -> (Frame, Bytes) {
        loop {
            let frame = self.recv_raw().await;
            if frame.as_ref() == PING_FRAME {
                continue;
            }
            let decoded = decode_frame(&frame).expect("client sent an undecodable frame");
            return (decoded, frame);
        }
    }
}

/// A [`MemoryKeystore`] that can be handed to the connector while the test
/// keeps a handle for inspection.
#[derive(Clone)]
pub struct SharedKeystore {
    inner: Arc<Mutex<MemoryKeystore>>,
}

impl SharedKeystore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryKeystore::new())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().contains(name)
    }
}

impl Default for SharedKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl Keystore for SharedKeystore {
    fn open(&mut self) -> Result<(), KeystoreError> {
        self.inner.lock().open()
    }

    fn close(&mut self) {
        self.inner.lock().close();
    }

    fn store_key(&mut self, name: &str, key: &[u8]) -> Result<(), KeystoreError> {
        self.inner.lock().store_key(name, key)
    }

    fn load_key(&self, name: &str) -> Result<SealedKey, KeystoreError> {
        self.inner.lock().load_key(name)
    }

    fn delete_key(&mut self, name: &str) -> Result<(), KeystoreError> {
        self.inner.lock().delete_key(name)
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.lock().contains(name)
    }
}

/// Transport factory whose connections are handed to the test as
/// [`ServerEnd`]s, with scriptable connection refusals.
pub struct ScriptedFactory {
    state: Mutex<FactoryState>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

struct FactoryState {
    refuse: usize,
    attempts: Vec<Instant>,
}

impl ScriptedFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(FactoryState {
                    refuse: 0,
                    attempts: Vec::new(),
                }),
                servers: tx,
            }),
            rx,
        )
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.state.lock().refuse = n;
    }

    /// Timestamps of every connect attempt so far.
    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(
        &self,
        _url: &str,
        _access_key: &str,
        _headers: &std::collections::BTreeMap<String, String>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock();
        state.attempts.push(Instant::now());
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::ConnectFailed("scripted refusal".into()));
        }
        drop(state);

        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            tx: server_tx,
            rx: server_rx,
        });
        Ok(Box::new(ScriptedTransport {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

/// Defaults used by the scripted tests: a fast signature scheme and a
/// configured remote so the connector starts connecting immediately.
pub fn test_defaults() -> Defaults {
    Defaults {
        remote: RemoteConfig {
            url: "wss://sync.test.example/ws".into(),
            access_key: "test-access".into(),
            headers: Default::default(),
            keepalive_timeout: 0,
        },
        sign_scheme: drift_crypto::asym::SignatureScheme::EcdsaEcpSha3_512,
        ..Defaults::default()
    }
}

/// A connector wired to in-memory settings, keystore and transport.
pub struct TestRig {
    pub handle: ConnectorHandle,
    pub events: mpsc::UnboundedReceiver<SyncEvent>,
    pub servers: mpsc::UnboundedReceiver<ServerEnd>,
    pub factory: Arc<ScriptedFactory>,
    pub settings: Arc<Settings>,
    pub keystore: SharedKeystore,
}

impl TestRig {
    pub fn spawn(defaults: Defaults) -> Self {
        Self::spawn_configured(defaults, Arc::new(Settings::in_memory()), 0)
    }

    /// Spawn with explicit settings and a number of connection attempts to
    /// refuse before the first one is accepted.
    pub fn spawn_configured(
        defaults: Defaults,
        settings: Arc<Settings>,
        refuse_connects: usize,
    ) -> Self {
        let (factory, servers) = ScriptedFactory::new();
        factory.refuse_next(refuse_connects);
        let keystore = SharedKeystore::new();
        let (handle, events) = RemoteConnector::spawn(
            settings.clone(),
            Box::new(keystore.clone()),
            factory.clone(),
            defaults,
        );
        Self {
            handle,
            events,
            servers,
            factory,
            settings,
            keystore,
        }
    }

    /// Next accepted connection.
    pub async fn next_server(&mut self) -> ServerEnd {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("factory gone")
    }

    /// Next emitted event.
    pub async fn next_event(&mut self) -> SyncEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connector gone")
    }

    /// Wait until `matches(event)` holds, returning that event and
    /// discarding everything before it.
    pub async fn event_matching(
        &mut self,
        matches: impl Fn(&SyncEvent) -> bool,
    ) -> SyncEvent {
        let mut seen = VecDeque::new();
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
            seen.push_back(event);
            assert!(
                seen.len() < 64,
                "expected event never arrived; saw {seen:?}"
            );
        }
    }
}
