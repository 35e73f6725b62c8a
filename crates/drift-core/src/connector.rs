//! The remote connector.
//!
//! Owns the WebSocket, the connection state machine, the retry and
//! keepalive timers, the in-flight caches, and the persistent settings that
//! carry identity and server configuration. Runs as a single task: every
//! transition, timer and façade call is processed on one cooperative loop.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drift_crypto::asym::PeerKeys;
use drift_crypto::export::ExportKey;
use drift_crypto::rng::fill_random;
use drift_proto::messages::{
    append_signature, key_update_signature_data, AcceptMessage, AccessMessage, AccountMessage,
    ChangeMessage, ChangedAckMessage, ChangedInfoMessage, ChangedMessage, DenyMessage,
    DeviceChangeMessage, DeviceKeysMessage, DevicesMessage, ErrorKind, ErrorMessage, GrantMessage,
    IdentifyMessage, KeyChangeMessage, KeyDeviceEntry, ListDevicesMessage, LoginMessage,
    MacUpdateMessage, Message, NewKeyMessage, NewKeyUpdate, ProofMessage, RegisterMessage,
    RemoveMessage, RemovedMessage, SyncMessage, WelcomeMessage, WireMessage, NONCE_SIZE,
    PING_FRAME,
};
use drift_proto::{decode_frame, encode_message};

use crate::config::{Defaults, RemoteConfig};
use crate::controller::CryptoController;
use crate::errors::{fatal_error_description, CoreError, TransportError};
use crate::events::{DeviceInfo, SyncEvent};
use crate::keystore::Keystore;
use crate::machine::{ConnectorState, ConnectorStateMachine, SmAction, SmEvent};
use crate::settings::{keys, Settings};
use crate::transport::{Transport, TransportFactory};

/// Retry backoff ladder; clamped at the last entry, reset on a successful
/// login or registration.
const RETRY_TIMEOUTS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// Guard for connect and handshake steps.
const SPECIAL_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Guard for the streaming download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// How long an unresolved untrusted proof stays pending before it is
/// auto-denied.
const PROOF_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything an account export hands to the partner device.
#[derive(Debug, Clone)]
pub struct ExportData {
    pub partner_id: Uuid,
    pub trusted: bool,
    pub p_nonce: Vec<u8>,
    pub scheme: String,
    pub cmac: Vec<u8>,
    pub config: Option<RemoteConfig>,
}

impl ExportData {
    /// The bytes covered by the export CMAC.
    pub fn sign_data(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(self.p_nonce.len() + 16 + self.scheme.len());
        data.extend_from_slice(&self.p_nonce);
        data.extend_from_slice(self.partner_id.as_bytes());
        data.extend_from_slice(self.scheme.as_bytes());
        data
    }
}

enum Command {
    Reconnect,
    Disconnect,
    Resync,
    ListDevices,
    RemoveDevice(Uuid),
    ResetAccount {
        clear_config: bool,
    },
    UploadData {
        key: Vec<u8>,
        data: Vec<u8>,
    },
    UploadDeviceData {
        key: Vec<u8>,
        device_id: Uuid,
        data: Vec<u8>,
    },
    DownloadDone(u64),
    InitKeyUpdate,
    LoginReply {
        device_id: Uuid,
        accept: bool,
    },
    SetSyncEnabled(bool),
    SetDeviceName(String),
    ResetDeviceName,
    ExportAccount {
        include_server: bool,
        password: Option<String>,
        reply: oneshot::Sender<Result<(ExportData, Vec<u8>, Vec<u8>), String>>,
    },
    PrepareImport {
        data: ExportData,
        key: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Finalize,
}

enum Internal {
    ConnectDone {
        generation: u64,
        result: Result<Box<dyn Transport>, TransportError>,
    },
}

enum Wake {
    Command(Option<Command>),
    Internal(Internal),
    Frame(Option<Result<Bytes, TransportError>>),
    RetryFire,
    PingFire,
    OpFire,
    ProofSweep,
    FinalizeFire,
}

/// Handle for the engine façade. All operations are forwarded onto the
/// connector's loop; operations invoked outside `Idle` are rejected there
/// with a log warning.
#[derive(Clone)]
pub struct ConnectorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectorHandle {
    fn send(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Disconnect and stay inactive until re-enabled or reconnected.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn resync(&self) {
        self.send(Command::Resync);
    }

    pub fn list_devices(&self) {
        self.send(Command::ListDevices);
    }

    pub fn remove_device(&self, device_id: Uuid) {
        self.send(Command::RemoveDevice(device_id));
    }

    pub fn reset_account(&self, clear_config: bool) {
        self.send(Command::ResetAccount { clear_config });
    }

    pub fn upload_data(&self, key: Vec<u8>, data: Vec<u8>) {
        self.send(Command::UploadData { key, data });
    }

    pub fn upload_device_data(&self, key: Vec<u8>, device_id: Uuid, data: Vec<u8>) {
        self.send(Command::UploadDeviceData {
            key,
            device_id,
            data,
        });
    }

    pub fn download_done(&self, data_index: u64) {
        self.send(Command::DownloadDone(data_index));
    }

    pub fn init_key_update(&self) {
        self.send(Command::InitKeyUpdate);
    }

    pub fn login_reply(&self, device_id: Uuid, accept: bool) {
        self.send(Command::LoginReply { device_id, accept });
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.send(Command::SetSyncEnabled(enabled));
    }

    pub fn set_device_name(&self, name: impl Into<String>) {
        self.send(Command::SetDeviceName(name.into()));
    }

    pub fn reset_device_name(&self) {
        self.send(Command::ResetDeviceName);
    }

    /// Export the account for a partner device. Returns the export payload,
    /// the KDF salt and the raw export key bytes.
    pub async fn export_account(
        &self,
        include_server: bool,
        password: Option<&str>,
    ) -> Result<(ExportData, Vec<u8>, Vec<u8>), String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ExportAccount {
            include_server,
            password: password.map(String::from),
            reply,
        });
        rx.await.map_err(|_| "connector gone".to_string())?
    }

    /// Stage an import received from a partner device. The caller is
    /// expected to follow up with `reset_account(false)` to trigger the
    /// access round on the next connect.
    pub async fn prepare_import(
        &self,
        data: ExportData,
        key: Option<Vec<u8>>,
    ) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PrepareImport { data, key, reply });
        rx.await.map_err(|_| "connector gone".to_string())?
    }

    /// Ordered shutdown; a `Finalized` event is emitted when done, or after
    /// the global deadline at the latest.
    pub fn finalize(&self) {
        self.send(Command::Finalize);
    }
}

/// The connector task state.
pub struct RemoteConnector {
    settings: Arc<Settings>,
    defaults: Defaults,
    crypto: CryptoController,
    machine: ConnectorStateMachine,
    factory: Arc<dyn TransportFactory>,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<SyncEvent>,

    socket: Option<Box<dyn Transport>>,
    connect_generation: u64,

    device_id: Option<Uuid>,
    expect_changes: bool,

    retry_index: usize,
    retry_deadline: Option<Instant>,

    keepalive: Duration,
    ping_deadline: Option<Instant>,
    awaiting_ping: bool,

    op_deadline: Option<Instant>,
    op_error_on_timeout: bool,

    finalize_deadline: Option<Instant>,
    finished: bool,

    device_cache: Vec<DeviceInfo>,
    exports_cache: HashMap<Vec<u8>, ExportKey>,
    active_proofs: HashMap<Uuid, (PeerKeys, Instant)>,
}

impl RemoteConnector {
    /// Build the connector and start its task. Returns the façade handle
    /// and the event stream.
    pub fn spawn(
        settings: Arc<Settings>,
        keystore: Box<dyn Keystore>,
        factory: Arc<dyn TransportFactory>,
        defaults: Defaults,
    ) -> (ConnectorHandle, mpsc::UnboundedReceiver<SyncEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (int_tx, int_rx) = mpsc::unbounded_channel();

        let crypto = CryptoController::new(settings.clone(), keystore, defaults.clone());
        let connector = RemoteConnector {
            settings,
            defaults,
            crypto,
            machine: ConnectorStateMachine::new(),
            factory,
            commands: cmd_rx,
            internal_tx: int_tx,
            internal_rx: int_rx,
            events: evt_tx,
            socket: None,
            connect_generation: 0,
            device_id: None,
            expect_changes: false,
            retry_index: 0,
            retry_deadline: None,
            keepalive: Duration::ZERO,
            ping_deadline: None,
            awaiting_ping: false,
            op_deadline: None,
            op_error_on_timeout: true,
            finalize_deadline: None,
            finished: false,
            device_cache: Vec::new(),
            exports_cache: HashMap::new(),
            active_proofs: HashMap::new(),
        };
        tokio::spawn(connector.run());
        (ConnectorHandle { tx: cmd_tx }, evt_rx)
    }

    async fn run(mut self) {
        self.crypto.initialize();
        let actions = self.machine.submit(SmEvent::Start);
        self.apply_actions(actions).await;

        while !self.finished {
            let wake = self.next_wake().await;
            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Internal(internal) => self.handle_internal(internal).await,
                Wake::Frame(frame) => self.handle_socket(frame).await,
                Wake::RetryFire => {
                    self.retry_deadline = None;
                    let actions = self.machine.submit(SmEvent::RetryTimer);
                    self.apply_actions(actions).await;
                }
                Wake::PingFire => self.on_ping_timer().await,
                Wake::OpFire => self.on_op_timeout().await,
                Wake::ProofSweep => self.sweep_proofs().await,
                Wake::FinalizeFire => {
                    warn!("shutdown deadline reached, tearing down");
                    self.socket = None;
                    self.finished = true;
                    self.emit(SyncEvent::Finalized);
                }
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        fn deadline_or_far(deadline: Option<Instant>) -> Instant {
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
        }

        let proof_deadline = self.active_proofs.values().map(|(_, d)| *d).min();
        let socket = &mut self.socket;
        let have_socket = socket.is_some();
        let commands = &mut self.commands;
        let internal = &mut self.internal_rx;
        let retry = self.retry_deadline;
        let ping = self.ping_deadline;
        let op = self.op_deadline;
        let fin = self.finalize_deadline;

        tokio::select! {
            // Deterministic priority: connect results, then inbound frames
            // in arrival order, then facade commands.
            biased;
            internal = internal.recv() => match internal {
                Some(internal) => Wake::Internal(internal),
                // The sender lives in this struct, so the channel never
                // closes while the loop runs.
                None => Wake::Command(None),
            },
            frame = async {
                match socket.as_mut() {
                    Some(socket) => socket.recv().await,
                    None => None,
                }
            }, if have_socket => Wake::Frame(frame),
            command = commands.recv() => Wake::Command(command),
            _ = tokio::time::sleep_until(deadline_or_far(retry)), if retry.is_some() => Wake::RetryFire,
            _ = tokio::time::sleep_until(deadline_or_far(ping)), if ping.is_some() => Wake::PingFire,
            _ = tokio::time::sleep_until(deadline_or_far(op)), if op.is_some() => Wake::OpFire,
            _ = tokio::time::sleep_until(deadline_or_far(fin)), if fin.is_some() => Wake::FinalizeFire,
            _ = tokio::time::sleep_until(deadline_or_far(proof_deadline)), if proof_deadline.is_some() => Wake::ProofSweep,
        }
    }

    // ------------------------------------------------------------------
    // State machine plumbing
    // ------------------------------------------------------------------

    async fn apply_actions(&mut self, actions: Vec<SmAction>) {
        let mut queue: VecDeque<SmAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SmAction::OpenSocket => {
                    if let Some(event) = self.do_connect() {
                        queue.extend(self.machine.submit(event));
                    }
                }
                SmAction::CloseSocket => {
                    self.do_close_socket().await;
                    queue.extend(self.machine.submit(SmEvent::Disconnected));
                }
                SmAction::ScheduleRetry => self.schedule_retry(),
                SmAction::EnterIdle => self.on_enter_idle().await,
                SmAction::ExitConnected => self.clear_caches(false),
                SmAction::ExitActive => {
                    self.end_op();
                    self.ping_deadline = None;
                    self.emit(SyncEvent::Disconnected);
                }
                SmAction::EmitFinished => {
                    self.finished = true;
                    self.emit(SyncEvent::Finalized);
                }
            }
        }
    }

    async fn trigger_error(&mut self, can_recover: bool) {
        let event = if can_recover {
            SmEvent::BasicError
        } else {
            SmEvent::FatalError
        };
        let actions = self.machine.submit(event);
        // Boxed: error handling can be reached from inside an action (a
        // send failing while entering Idle), which would otherwise make
        // this future recursive.
        Box::pin(self.apply_actions(actions)).await;
    }

    async fn submit(&mut self, event: SmEvent) {
        let actions = self.machine.submit(event);
        self.apply_actions(actions).await;
    }

    fn is_idle(&self) -> bool {
        self.machine.state() == ConnectorState::Idle
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    /// Begin a connection attempt. Returns the event to feed back when the
    /// attempt cannot even start.
    fn do_connect(&mut self) -> Option<SmEvent> {
        self.emit(SyncEvent::Reconnecting);
        if !self.check_can_sync() {
            return Some(SmEvent::NoConnect);
        }

        let url = self.s_url();
        let access_key = self.s_access_key();
        let headers = self.s_headers();

        self.keepalive = Duration::from_secs(u64::from(self.s_keepalive_timeout()) * 60);
        self.awaiting_ping = false;

        self.begin_op(SPECIAL_OP_TIMEOUT, true);
        self.connect_generation += 1;
        let generation = self.connect_generation;
        let factory = self.factory.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = factory.connect(&url, &access_key, &headers).await;
            let _ = tx.send(Internal::ConnectDone { generation, result });
        });
        debug!("connecting to remote server");
        None
    }

    fn check_can_sync(&mut self) -> bool {
        if self.machine.is_closing() {
            return false;
        }
        if !self.load_identity() {
            error!("unable to load user identity, cannot synchronize");
            return false;
        }
        if !self.s_enabled() {
            debug!("remote has been disabled, not connecting");
            return false;
        }
        if self.s_url().is_empty() {
            debug!("cannot connect to remote - no URL defined");
            return false;
        }
        true
    }

    fn load_identity(&mut self) -> bool {
        let new_id = self.settings.get_uuid(keys::DEVICE_ID);
        if new_id != self.device_id || new_id.is_none() {
            self.device_id = new_id;
            self.crypto.clear_key_material();
            if !self.crypto.acquire_store() {
                return false;
            }
            let Some(device_id) = self.device_id else {
                // No identity yet: the next identify round registers or
                // imports.
                return true;
            };
            if let Err(err) = self.crypto.load_key_material(device_id) {
                error!("failed to load key material: {err}");
                return false;
            }
        }
        true
    }

    async fn do_close_socket(&mut self) {
        // Abort any connect still in flight.
        self.connect_generation += 1;
        self.ping_deadline = None;
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ConnectDone { generation, result } => {
                if generation != self.connect_generation {
                    debug!("discarding stale connect result");
                    return;
                }
                match result {
                    Ok(socket) => {
                        self.end_op();
                        debug!("successfully connected to remote server");
                        self.socket = Some(socket);
                        self.restart_ping();
                        self.submit(SmEvent::Connected).await;
                        // Bound the whole handshake until Idle is reached.
                        self.begin_op(SPECIAL_OP_TIMEOUT, true);
                    }
                    Err(err) => {
                        self.end_op();
                        self.log_retry(&format!("failed to connect to server: {err}"));
                        self.submit(SmEvent::Disconnected).await;
                    }
                }
            }
        }
    }

    async fn handle_socket(&mut self, frame: Option<Result<Bytes, TransportError>>) {
        match frame {
            None => {
                if self.machine.state().in_connected() {
                    self.log_retry("unexpected disconnect from server");
                } else {
                    debug!("remote server has been disconnected");
                }
                self.socket = None;
                self.ping_deadline = None;
                self.end_op();
                self.submit(SmEvent::Disconnected).await;
            }
            Some(Err(err)) => {
                self.log_retry(&format!("server connection socket error: {err}"));
                self.socket = None;
                self.ping_deadline = None;
                self.end_op();
                self.submit(SmEvent::Disconnected).await;
            }
            Some(Ok(frame)) => {
                if frame.as_ref() == PING_FRAME {
                    self.awaiting_ping = false;
                    self.restart_ping();
                    return;
                }
                match decode_frame(&frame) {
                    Err(err) => {
                        error!("remote message error: {err}");
                        self.trigger_error(true).await;
                    }
                    Ok(decoded) => {
                        let name = decoded.message.type_name();
                        if let Err(err) = self.handle_message(decoded.message).await {
                            self.on_error(err.to_error_message(), Some(name)).await;
                        }
                    }
                }
            }
        }
    }

    fn log_retry(&self, message: &str) {
        if self.retry_index == 0 {
            warn!("{message}");
        } else {
            debug!("{message} (repeated)");
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn begin_op(&mut self, timeout: Duration, error_on_timeout: bool) {
        self.op_deadline = Some(Instant::now() + timeout);
        self.op_error_on_timeout = error_on_timeout;
    }

    fn end_op(&mut self) {
        self.op_deadline = None;
    }

    async fn on_op_timeout(&mut self) {
        self.op_deadline = None;
        if self.op_error_on_timeout {
            debug!("operation guard expired");
            self.trigger_error(true).await;
        } else {
            debug!("operation guard expired without error");
        }
    }

    fn restart_ping(&mut self) {
        if self.keepalive > Duration::ZERO && self.socket.is_some() {
            self.ping_deadline = Some(Instant::now() + self.keepalive);
        } else {
            self.ping_deadline = None;
        }
    }

    async fn on_ping_timer(&mut self) {
        self.ping_deadline = None;
        if self.awaiting_ping {
            self.awaiting_ping = false;
            debug!("server connection idle, reconnecting to server");
            self.submit(SmEvent::Reconnect).await;
        } else if self.socket.is_some() {
            self.awaiting_ping = true;
            self.send_frame(Bytes::from_static(PING_FRAME)).await;
            self.restart_ping();
        }
    }

    fn schedule_retry(&mut self) {
        let delay = if self.retry_index >= RETRY_TIMEOUTS.len() {
            RETRY_TIMEOUTS[RETRY_TIMEOUTS.len() - 1]
        } else {
            let delay = RETRY_TIMEOUTS[self.retry_index];
            self.retry_index += 1;
            delay
        };
        self.retry_deadline = Some(Instant::now() + delay);
        debug!("retrying to connect to server in {}s", delay.as_secs());
    }

    async fn sweep_proofs(&mut self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .active_proofs
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for device_id in expired {
            self.active_proofs.remove(&device_id);
            warn!("rejecting proof request from {device_id} after timeout");
            self.send_message(&DenyMessage { device_id }).await;
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    async fn send_frame(&mut self, frame: Bytes) {
        let Some(socket) = self.socket.as_mut() else {
            warn!("no socket to send on");
            return;
        };
        if let Err(err) = socket.send(frame).await {
            warn!("socket send failed: {err}");
            self.trigger_error(true).await;
        }
    }

    async fn send_message<M: WireMessage>(&mut self, message: &M) {
        match encode_message(message) {
            Ok(frame) => self.send_frame(frame).await,
            Err(err) => {
                error!("failed to encode {}: {err}", M::NAME);
                self.trigger_error(true).await;
            }
        }
    }

    async fn send_signed_message<M: WireMessage>(
        &mut self,
        message: &M,
    ) -> Result<(), CoreError> {
        let frame = encode_message(message)?;
        let signature = self.crypto.sign(&frame)?;
        self.send_frame(append_signature(frame, &signature)).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands from the façade
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reconnect => self.submit(SmEvent::Reconnect).await,
            Command::Disconnect => self.trigger_error(false).await,
            Command::Resync => {
                if !self.is_idle() {
                    info!("cannot resync when not in idle state, ignoring request");
                    return;
                }
                self.emit(SyncEvent::ReadyWithChanges);
                self.send_message(&SyncMessage).await;
            }
            Command::ListDevices => {
                if !self.is_idle() {
                    info!("cannot list devices when not in idle state, ignoring request");
                    return;
                }
                self.send_message(&ListDevicesMessage).await;
            }
            Command::RemoveDevice(device_id) => {
                if !self.is_idle() {
                    info!("cannot remove a device when not in idle state, ignoring request");
                    return;
                }
                if Some(device_id) == self.device_id {
                    warn!("cannot delete your own device, reset the account instead");
                    return;
                }
                self.send_message(&RemoveMessage { device_id }).await;
            }
            Command::ResetAccount { clear_config } => self.reset_account(clear_config).await,
            Command::UploadData { key, data } => self.upload_data(key, None, data).await,
            Command::UploadDeviceData {
                key,
                device_id,
                data,
            } => self.upload_data(key, Some(device_id), data).await,
            Command::DownloadDone(data_index) => {
                if !self.is_idle() {
                    info!("cannot acknowledge downloads when not in idle state, ignoring request");
                    return;
                }
                self.send_message(&ChangedAckMessage { data_index }).await;
                self.emit(SyncEvent::ProgressIncrement);
                self.begin_op(DOWNLOAD_TIMEOUT, false);
            }
            Command::InitKeyUpdate => self.init_key_update().await,
            Command::LoginReply { device_id, accept } => {
                self.login_reply(device_id, accept).await
            }
            Command::SetSyncEnabled(enabled) => {
                if self.s_enabled() == enabled {
                    return;
                }
                self.settings.set_bool(keys::ENABLED, enabled);
                self.submit(SmEvent::Reconnect).await;
                self.emit(SyncEvent::SyncEnabledChanged(enabled));
            }
            Command::SetDeviceName(name) => {
                if self.s_device_name() != name {
                    self.settings.set_str(keys::DEVICE_NAME, &name);
                    self.emit(SyncEvent::DeviceNameChanged(name));
                    self.submit(SmEvent::Reconnect).await;
                }
            }
            Command::ResetDeviceName => {
                if self.settings.contains(keys::DEVICE_NAME) {
                    self.settings.remove(keys::DEVICE_NAME);
                    self.emit(SyncEvent::DeviceNameChanged(self.s_device_name()));
                    self.submit(SmEvent::Reconnect).await;
                }
            }
            Command::ExportAccount {
                include_server,
                password,
                reply,
            } => {
                let result = self
                    .export_account(include_server, password.as_deref())
                    .map_err(|err| err.to_string());
                let _ = reply.send(result);
            }
            Command::PrepareImport { data, key, reply } => {
                let result = self.prepare_import(data, key).map_err(|err| err.to_string());
                let _ = reply.send(result);
            }
            Command::Finalize => self.finalize().await,
        }
    }

    async fn upload_data(&mut self, key: Vec<u8>, target: Option<Uuid>, data: Vec<u8>) {
        if !self.is_idle() {
            info!("cannot upload when not in idle state, ignoring request");
            return;
        }
        match self.crypto.encrypt_data(&data) {
            Ok((key_index, salt, data)) => {
                self.emit(SyncEvent::Sending);
                match target {
                    None => {
                        self.send_message(&ChangeMessage {
                            data_id: key,
                            key_index,
                            salt,
                            data,
                        })
                        .await
                    }
                    Some(device_id) => {
                        self.send_message(&DeviceChangeMessage {
                            data_id: key,
                            device_id,
                            key_index,
                            salt,
                            data,
                        })
                        .await
                    }
                }
            }
            Err(err) => {
                self.on_error(err.to_error_message(), Some(ChangeMessage::NAME))
                    .await
            }
        }
    }

    async fn init_key_update(&mut self) {
        if !self.is_idle() {
            warn!("cannot update secret keys when not in idle state, ignoring request");
            return;
        }
        let next_index = self.crypto.key_index() + 1;
        self.send_message(&KeyChangeMessage { next_index }).await;
    }

    async fn login_reply(&mut self, device_id: Uuid, accept: bool) {
        if !self.is_idle() {
            warn!("cannot react to login when not in idle state, ignoring request");
            return;
        }
        let Some((peer, _)) = self.active_proofs.remove(&device_id) else {
            warn!("received login reply for nonexistent request, probably already handled");
            return;
        };
        if !accept {
            self.send_message(&DenyMessage { device_id }).await;
            return;
        }
        match self.crypto.encrypt_secret_key(None, &peer.crypt) {
            Ok((index, scheme, secret)) => {
                self.send_message(&AcceptMessage {
                    device_id,
                    index,
                    scheme,
                    secret,
                })
                .await;
                self.emit(SyncEvent::AccountAccessGranted(device_id));
            }
            Err(err) => {
                warn!("failed to reply to login with error: {err}");
                self.send_message(&DenyMessage { device_id }).await;
            }
        }
    }

    async fn reset_account(&mut self, clear_config: bool) {
        if clear_config {
            // Always clear imports as well, so a staged import cannot
            // outlive the account it belonged to.
            self.settings.remove_group(keys::REMOTE_GROUP);
            self.settings.remove_group(keys::IMPORT_GROUP);
        }

        let device_id = self
            .device_id
            .or_else(|| self.settings.get_uuid(keys::DEVICE_ID));
        match device_id {
            Some(device_id) => {
                self.clear_caches(true);
                self.settings.remove(keys::DEVICE_ID);
                self.crypto.delete_key_material(device_id);
                if self.is_idle() {
                    // Delete this device; the remote disconnects once done.
                    self.send_message(&RemoveMessage { device_id }).await;
                } else {
                    self.device_id = None;
                    self.submit(SmEvent::Reconnect).await;
                }
            }
            None => {
                info!("skipping server reset, not registered to a server");
                // Still reconnect: this completes the operation and is
                // needed for imports.
                self.submit(SmEvent::Reconnect).await;
            }
        }
    }

    fn export_account(
        &mut self,
        include_server: bool,
        password: Option<&str>,
    ) -> Result<(ExportData, Vec<u8>, Vec<u8>), CoreError> {
        let partner_id = self.device_id.ok_or(CoreError::NotRegistered)?;

        let mut p_nonce = vec![0u8; NONCE_SIZE];
        fill_random(&mut p_nonce)?;

        let (scheme, salt, key) = self.crypto.generate_export_key(password)?;
        let mut data = ExportData {
            partner_id,
            trusted: password.is_some(),
            p_nonce,
            scheme,
            cmac: Vec::new(),
            config: include_server.then(|| self.load_config()),
        };
        data.cmac = self
            .crypto
            .create_export_cmac(&data.scheme, &key, &data.sign_data())?;

        self.exports_cache.insert(data.p_nonce.clone(), key.clone());
        Ok((data, salt, key.as_bytes().to_vec()))
    }

    fn prepare_import(
        &mut self,
        data: ExportData,
        key: Option<Vec<u8>>,
    ) -> Result<(), CoreError> {
        match &data.config {
            Some(config) => self.store_config(config),
            None => self.settings.remove_group(keys::REMOTE_GROUP),
        }
        self.settings.set_bytes(keys::IMPORT_NONCE, &data.p_nonce);
        self.settings.set_uuid(keys::IMPORT_PARTNER, &data.partner_id);
        self.settings.set_str(keys::IMPORT_SCHEME, &data.scheme);
        self.settings.set_bytes(keys::IMPORT_CMAC, &data.cmac);
        if data.trusted {
            let key = key.ok_or_else(|| {
                CoreError::Protocol("trusted import requires the export key".into())
            })?;
            self.settings.set_bytes(keys::IMPORT_KEY, &key);
        } else {
            self.settings.remove(keys::IMPORT_KEY);
        }
        Ok(())
    }

    async fn finalize(&mut self) {
        self.ping_deadline = None;
        self.crypto.finalize();
        self.submit(SmEvent::Close).await;
        if !self.finished {
            let timeout = self
                .defaults
                .global_timeout
                .saturating_sub(Duration::from_secs(1))
                .max(Duration::from_secs(1));
            self.finalize_deadline = Some(Instant::now() + timeout);
        }
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    async fn handle_message(&mut self, message: Message) -> Result<(), CoreError> {
        match message {
            Message::Error(m) => {
                self.on_error(m, None).await;
                Ok(())
            }
            Message::Identify(m) => self.on_identify(m).await,
            Message::Account(m) => self.on_account(m, true).await,
            Message::Welcome(m) => self.on_welcome(m).await,
            Message::Grant(m) => self.on_grant(m).await,
            Message::ChangeAck(m) => {
                if self.expect_idle(drift_proto::messages::ChangeAckMessage::NAME).await {
                    self.emit(SyncEvent::UploadDone(m.data_id));
                }
                Ok(())
            }
            Message::DeviceChangeAck(m) => {
                if self
                    .expect_idle(drift_proto::messages::DeviceChangeAckMessage::NAME)
                    .await
                {
                    self.emit(SyncEvent::DeviceUploadDone(m.data_id, m.device_id));
                }
                Ok(())
            }
            Message::Changed(m) => self.on_changed(m).await,
            Message::ChangedInfo(m) => self.on_changed_info(m).await,
            Message::LastChanged(_) => {
                if self.expect_idle(drift_proto::messages::LastChangedMessage::NAME).await {
                    debug!("completed downloading changes");
                    self.end_op();
                    self.emit(SyncEvent::Ready);
                }
                Ok(())
            }
            Message::Devices(m) => self.on_devices(m).await,
            Message::Removed(m) => self.on_removed(m).await,
            Message::Proof(m) => self.on_proof(m).await,
            Message::MacUpdateAck(_) => {
                if self
                    .expect_idle(drift_proto::messages::MacUpdateAckMessage::NAME)
                    .await
                {
                    self.settings.remove(keys::SEND_CMAC);
                }
                Ok(())
            }
            Message::DeviceKeys(m) => self.on_device_keys(m).await,
            Message::NewKeyAck(m) => {
                if self.expect_idle(drift_proto::messages::NewKeyAckMessage::NAME).await {
                    self.crypto.activate_next_key(m.key_index);
                }
                Ok(())
            }
            other => {
                warn!("unknown message received: {}", other.type_name());
                self.trigger_error(true).await;
                Ok(())
            }
        }
    }

    /// Idle check for steady-state messages; an unexpected message is a
    /// recoverable protocol error.
    async fn expect_idle(&mut self, name: &str) -> bool {
        if self.is_idle() {
            true
        } else {
            warn!("unexpected {name} message");
            self.trigger_error(true).await;
            false
        }
    }

    async fn on_error(&mut self, message: ErrorMessage, local_context: Option<&str>) {
        match local_context {
            Some(name) => error!("local error on {name}: {}", message.message),
            None => error!(
                "server error {:?} (recoverable: {}): {}",
                message.kind, message.can_recover, message.message
            ),
        }
        self.trigger_error(message.can_recover).await;
        if !message.can_recover {
            self.emit(SyncEvent::ControllerError(fatal_error_description(
                message.kind,
            )));
        }
    }

    async fn on_identify(&mut self, message: IdentifyMessage) -> Result<(), CoreError> {
        if self.machine.state() != ConnectorState::Identifying {
            warn!("unexpected Identify message");
            self.trigger_error(true).await;
            return Ok(());
        }
        self.emit(SyncEvent::UpdateUploadLimit(message.upload_limit));

        if let Some(device_id) = self.device_id {
            let login = LoginMessage {
                device_id,
                device_name: self.s_device_name(),
                nonce: message.nonce,
            };
            self.submit(SmEvent::AwaitLogin).await;
            self.send_signed_message(&login).await?;
            debug!("sent login message for device id {device_id}");
            return Ok(());
        }

        self.crypto.create_private_keys(&message.nonce)?;
        match self.settings.get_bytes(keys::IMPORT_NONCE) {
            None => {
                let register = RegisterMessage {
                    device_name: self.s_device_name(),
                    nonce: message.nonce,
                    sign_scheme: self.crypto.sign_scheme_tag()?.to_string(),
                    sign_key: self.crypto.sign_public_der()?,
                    crypt_scheme: self.crypto.crypt_scheme_tag()?.to_string(),
                    crypt_key: self.crypto.crypt_public_der()?,
                    cmac: self.crypto.generate_encryption_key_cmac(None)?,
                };
                self.submit(SmEvent::AwaitRegister).await;
                self.send_signed_message(&register).await?;
                debug!("sent registration message for new id");
            }
            Some(p_nonce) => {
                let scheme = self
                    .settings
                    .get_str(keys::IMPORT_SCHEME)
                    .ok_or_else(|| CoreError::Protocol("import staging incomplete".into()))?;
                let trust_cmac = match self.settings.get_bytes(keys::IMPORT_KEY) {
                    Some(key_bytes) => {
                        let key = ExportKey::from_bytes(&key_bytes)?;
                        Some(self.crypto.create_export_cmac_for_keys(
                            &scheme,
                            &key,
                            self.crypto.crypt_scheme_tag()?,
                            &self.crypto.crypt_public_der()?,
                        )?)
                    }
                    None => None,
                };
                let access = AccessMessage {
                    device_name: self.s_device_name(),
                    nonce: message.nonce,
                    sign_scheme: self.crypto.sign_scheme_tag()?.to_string(),
                    sign_key: self.crypto.sign_public_der()?,
                    crypt_scheme: self.crypto.crypt_scheme_tag()?.to_string(),
                    crypt_key: self.crypto.crypt_public_der()?,
                    partner_id: self
                        .settings
                        .get_uuid(keys::IMPORT_PARTNER)
                        .ok_or_else(|| CoreError::Protocol("import staging incomplete".into()))?,
                    p_nonce,
                    mac_scheme: scheme,
                    cmac: self
                        .settings
                        .get_bytes(keys::IMPORT_CMAC)
                        .ok_or_else(|| CoreError::Protocol("import staging incomplete".into()))?,
                    trust_cmac,
                };
                self.submit(SmEvent::AwaitGranted).await;
                self.send_signed_message(&access).await?;
                debug!("sent access message for new id");
            }
        }
        Ok(())
    }

    async fn on_account(
        &mut self,
        message: AccountMessage,
        check_state: bool,
    ) -> Result<(), CoreError> {
        if check_state && self.machine.state() != ConnectorState::Registering {
            warn!("unexpected Account message");
            self.trigger_error(true).await;
            return Ok(());
        }
        self.device_id = Some(message.device_id);
        self.settings.set_uuid(keys::DEVICE_ID, &message.device_id);
        // Persist the effective configuration, in case it came from the
        // compiled-in defaults.
        let config = self.load_config();
        self.store_config(&config);

        self.crypto.store_private_keys(message.device_id)?;
        debug!("registration successful");
        self.expect_changes = false;
        self.submit(SmEvent::Account).await;
        Ok(())
    }

    async fn on_welcome(&mut self, message: WelcomeMessage) -> Result<(), CoreError> {
        if self.machine.state() != ConnectorState::LoggingIn {
            warn!("unexpected Welcome message");
            self.trigger_error(true).await;
            return Ok(());
        }
        debug!("login successful");
        self.expect_changes = message.has_changes;
        self.submit(SmEvent::Account).await;

        let device_id = self.device_id.ok_or(CoreError::NotRegistered)?;
        let mut key_updated = false;
        for update in &message.key_updates {
            // Updates are ordered by index and verified under the key that
            // was active before each of them; a gap is a protocol error.
            let expected = self.crypto.key_index() + 1;
            if update.index != expected {
                self.on_error(
                    ErrorMessage {
                        kind: ErrorKind::KeyIndex,
                        can_recover: false,
                        message: format!(
                            "non-consecutive key update index {} (expected {expected})",
                            update.index
                        ),
                    },
                    None,
                )
                .await;
                return Ok(());
            }
            let data =
                key_update_signature_data(&device_id, update.index, &update.scheme, &update.key);
            self.crypto
                .verify_cmac(self.crypto.key_index(), &data, &update.cmac)?;
            self.crypto
                .decrypt_secret_key(update.index, &update.scheme, &update.key, false)?;
            key_updated = true;
        }

        if key_updated || self.settings.get_bool(keys::SEND_CMAC).unwrap_or(false) {
            self.send_key_update().await?;
        }
        Ok(())
    }

    async fn on_grant(&mut self, message: GrantMessage) -> Result<(), CoreError> {
        if self.machine.state() != ConnectorState::Granting {
            warn!("unexpected Grant message");
            self.trigger_error(true).await;
            return Ok(());
        }
        debug!("account access granted");
        self.crypto
            .decrypt_secret_key(message.index, &message.scheme, &message.secret, true)?;
        self.on_account(
            AccountMessage {
                device_id: message.device_id,
            },
            false,
        )
        .await?;
        // The import succeeded, drop the staging keys.
        self.settings.remove_group(keys::IMPORT_GROUP);
        self.send_key_update().await?;
        self.emit(SyncEvent::ImportCompleted);
        Ok(())
    }

    async fn send_key_update(&mut self) -> Result<(), CoreError> {
        // Set before sending: a crash between these two steps re-sends the
        // proof on the next login.
        self.settings.set_bool(keys::SEND_CMAC, true);
        let cmac = self.crypto.generate_encryption_key_cmac(None)?;
        let message = MacUpdateMessage {
            key_index: self.crypto.key_index(),
            cmac,
        };
        self.send_message(&message).await;
        Ok(())
    }

    async fn on_changed(&mut self, message: ChangedMessage) -> Result<(), CoreError> {
        if !self.expect_idle(ChangedMessage::NAME).await {
            return Ok(());
        }
        let data =
            self.crypto
                .decrypt_data(message.key_index, &message.salt, &message.data)?;
        self.begin_op(DOWNLOAD_TIMEOUT, true);
        self.emit(SyncEvent::DownloadData(message.data_index, data));
        Ok(())
    }

    async fn on_changed_info(&mut self, message: ChangedInfoMessage) -> Result<(), CoreError> {
        if !self.expect_idle(ChangedInfoMessage::NAME).await {
            return Ok(());
        }
        debug!(
            "started downloading, estimated changes: {}",
            message.change_estimate
        );
        self.emit(SyncEvent::ReadyWithChanges);
        self.emit(SyncEvent::ProgressAdded(message.change_estimate));
        self.on_changed(message.to_changed()).await
    }

    async fn on_devices(&mut self, message: DevicesMessage) -> Result<(), CoreError> {
        if !self.expect_idle(DevicesMessage::NAME).await {
            return Ok(());
        }
        debug!(
            "received list of devices with {} entries",
            message.devices.len()
        );
        self.device_cache = message
            .devices
            .into_iter()
            .map(|d| DeviceInfo {
                device_id: d.device_id,
                name: d.name,
                fingerprint: d.fingerprint,
            })
            .collect();
        self.emit(SyncEvent::DevicesListed(self.device_cache.clone()));
        Ok(())
    }

    async fn on_removed(&mut self, message: RemovedMessage) -> Result<(), CoreError> {
        if !self.expect_idle(RemovedMessage::NAME).await {
            return Ok(());
        }
        debug!("device with id {} was removed", message.device_id);
        if Some(message.device_id) == self.device_id {
            // Covers both self-removal and removal initiated by a peer.
            self.crypto.delete_key_material(message.device_id);
            self.settings.remove(keys::DEVICE_ID);
            self.device_id = None;
            self.submit(SmEvent::Reconnect).await;
        } else {
            let before = self.device_cache.len();
            self.device_cache
                .retain(|d| d.device_id != message.device_id);
            if self.device_cache.len() != before {
                self.emit(SyncEvent::DevicesListed(self.device_cache.clone()));
            }
        }
        Ok(())
    }

    async fn on_proof(&mut self, message: ProofMessage) -> Result<(), CoreError> {
        if !self.expect_idle(ProofMessage::NAME).await {
            return Ok(());
        }
        match self.verify_proof(&message) {
            Ok(Some(info)) => {
                // Untrusted: wait for the user, auto-deny after the TTL.
                self.emit(SyncEvent::LoginRequested(info));
            }
            Ok(None) => {
                // Trusted: the export key already proves the partner.
                self.login_reply(message.device_id, true).await;
            }
            Err(err) => {
                warn!("rejecting Proof message with error: {err}");
                self.send_message(&DenyMessage {
                    device_id: message.device_id,
                })
                .await;
            }
        }
        Ok(())
    }

    /// Verify a proof request. Returns `Some(info)` for an untrusted proof
    /// now pending user acceptance, `None` for a verified trusted proof.
    fn verify_proof(&mut self, message: &ProofMessage) -> Result<Option<DeviceInfo>, CoreError> {
        let key = self
            .exports_cache
            .remove(&message.p_nonce)
            .ok_or(CoreError::UnknownProof)?;
        let own_id = self.device_id.ok_or(CoreError::NotRegistered)?;

        let mut mac_data =
            Vec::with_capacity(message.p_nonce.len() + 16 + message.mac_scheme.len());
        mac_data.extend_from_slice(&message.p_nonce);
        mac_data.extend_from_slice(own_id.as_bytes());
        mac_data.extend_from_slice(message.mac_scheme.as_bytes());
        self.crypto
            .verify_import_cmac(&message.mac_scheme, &key, &mac_data, &message.cmac)?;

        let peer = PeerKeys::new(
            &message.sign_scheme,
            &message.sign_key,
            &message.crypt_scheme,
            &message.crypt_key,
        )?;

        let trusted = match &message.trust_cmac {
            Some(trust_cmac) => {
                self.crypto
                    .verify_import_cmac_for_keys(&message.mac_scheme, &key, &peer, trust_cmac)?;
                info!(
                    "accepted trusted import proof request for device {}",
                    message.device_id
                );
                true
            }
            None => {
                info!(
                    "received untrusted import proof request for device {}",
                    message.device_id
                );
                false
            }
        };

        let fingerprint = peer.fingerprint()?;
        self.active_proofs.insert(
            message.device_id,
            (peer, Instant::now() + PROOF_TIMEOUT),
        );
        Ok(if trusted {
            None
        } else {
            Some(DeviceInfo {
                device_id: message.device_id,
                name: message.device_name.clone(),
                fingerprint,
            })
        })
    }

    async fn on_device_keys(&mut self, message: DeviceKeysMessage) -> Result<(), CoreError> {
        if !self.expect_idle(DeviceKeysMessage::NAME).await {
            return Ok(());
        }
        if message.duplicated {
            // Another device already rotated to this index; its update will
            // arrive with the next Welcome.
            self.crypto.activate_next_key(message.key_index);
            return Ok(());
        }

        let (key_index, scheme) = self.crypto.generate_next_key()?;
        // CMAC for the new key, under the new key. Not persisted as the
        // send-again proof.
        let cmac = self.crypto.generate_encryption_key_cmac(Some(key_index))?;

        let mut device_keys = Vec::new();
        for entry in &message.devices {
            match self.prepare_key_update(key_index, entry) {
                Ok(update) => {
                    debug!("prepared key update for device {}", entry.device_id);
                    device_keys.push(update);
                }
                Err(err) => {
                    warn!(
                        "failed to prepare key update for device {} - device is going to be excluded from synchronisation, error: {err}",
                        entry.device_id
                    );
                }
            }
        }

        self.send_message(&NewKeyMessage {
            key_index,
            scheme,
            cmac,
            device_keys,
        })
        .await;
        debug!("sent key update to server");
        Ok(())
    }

    fn prepare_key_update(
        &self,
        key_index: u32,
        entry: &KeyDeviceEntry,
    ) -> Result<NewKeyUpdate, CoreError> {
        let peer = PeerKeys::new(
            &entry.sign_scheme,
            &entry.sign_key,
            &entry.crypt_scheme,
            &entry.crypt_key,
        )?;
        // The peer must prove knowledge of the previous secret (which is
        // still the current one).
        self.crypto.verify_encryption_key_cmac(&peer, &entry.cmac)?;

        let (index, scheme, wrapped) = self.crypto.encrypt_secret_key(Some(key_index), &peer.crypt)?;
        let data = key_update_signature_data(&entry.device_id, index, &scheme, &wrapped);
        // MACed under the previous (still active) key.
        let cmac = self.crypto.create_cmac(&data)?;
        Ok(NewKeyUpdate {
            device_id: entry.device_id,
            key: wrapped,
            cmac,
        })
    }

    async fn on_enter_idle(&mut self) {
        self.retry_index = 0;
        self.end_op();
        if self.crypto.has_key_update() {
            self.init_key_update().await;
        }
        if self.expect_changes {
            self.expect_changes = false;
            debug!("server has changes, reloading states");
            self.emit(SyncEvent::ReadyWithChanges);
        } else {
            self.emit(SyncEvent::Ready);
        }
    }

    fn clear_caches(&mut self, include_exports: bool) {
        self.device_cache.clear();
        if include_exports {
            self.exports_cache.clear();
        }
        self.active_proofs.clear();
    }

    // ------------------------------------------------------------------
    // Settings with defaults fallback
    // ------------------------------------------------------------------

    fn s_enabled(&self) -> bool {
        self.settings.get_bool(keys::ENABLED).unwrap_or(true)
    }

    fn s_url(&self) -> String {
        self.settings
            .get_str(keys::REMOTE_URL)
            .unwrap_or_else(|| self.defaults.remote.url.clone())
    }

    fn s_access_key(&self) -> String {
        self.settings
            .get_str(keys::ACCESS_KEY)
            .unwrap_or_else(|| self.defaults.remote.access_key.clone())
    }

    fn s_keepalive_timeout(&self) -> u32 {
        self.settings
            .get_u32(keys::KEEPALIVE_TIMEOUT)
            .unwrap_or(self.defaults.remote.keepalive_timeout)
    }

    fn s_device_name(&self) -> String {
        self.settings.get_str(keys::DEVICE_NAME).unwrap_or_else(|| {
            gethostname::gethostname().to_string_lossy().into_owned()
        })
    }

    fn s_headers(&self) -> BTreeMap<String, String> {
        let names = self.settings.child_keys(keys::HEADERS);
        if names.is_empty() {
            return self.defaults.remote.headers.clone();
        }
        names
            .into_iter()
            .filter_map(|name| {
                let value = self.settings.get_str(&format!("{}/{name}", keys::HEADERS))?;
                Some((name, value))
            })
            .collect()
    }

    fn load_config(&self) -> RemoteConfig {
        RemoteConfig {
            url: self.s_url(),
            access_key: self.s_access_key(),
            headers: self.s_headers(),
            keepalive_timeout: self.s_keepalive_timeout(),
        }
    }

    fn store_config(&self, config: &RemoteConfig) {
        self.settings.set_str(keys::REMOTE_URL, &config.url);
        self.settings.set_str(keys::ACCESS_KEY, &config.access_key);
        for (name, value) in &config.headers {
            self.settings
                .set_str(&format!("{}/{name}", keys::HEADERS), value);
        }
        self.settings
            .set_u32(keys::KEEPALIVE_TIMEOUT, config.keepalive_timeout);
    }
}
