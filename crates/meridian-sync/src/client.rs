//! # Sync Client
//!
//! Owns one realtime socket: the authentication handshake, the heartbeat,
//! request/response correlation and the per-channel cache. It never decides
//! *whether* to connect; that is the orchestrator's job.
//!
//! ## Link Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncClient Phases                              │
//! │                                                                         │
//! │  ┌──────┐  connect()  ┌────────────┐  server CONNECT  ┌───────────┐     │
//! │  │ Idle │ ──────────► │ Connecting │ ───────────────► │ Connected │     │
//! │  └──────┘             └─────┬──────┘                  └─────┬─────┘     │
//! │     ▲                       │ timeout / cancel /            │           │
//! │     │                       │ disconnect before CONNECT     │ link lost │
//! │     └───────────────────────┴───────────────────────────────┘ or        │
//! │                                                      disconnect()       │
//! │                                                                         │
//! │  Every connect()/disconnect() bumps the GENERATION. Reader and          │
//! │  heartbeat tasks carry the generation they were spawned for and        │
//! │  ignore everything once it is stale.                                   │
//! │                                                                         │
//! │  ON ESTABLISHED (under one lock)                                       │
//! │  ───────────────────────────────                                       │
//! │  1. phase = Connected, attempts = 0                                    │
//! │  2. replay pending actions FIFO                                        │
//! │  3. start heartbeat                                                    │
//! │  4. (lock released) emit Connect                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! User callbacks (channel subscribers and event listeners) always run with
//! the state lock released, so they may call back into the client.

use chrono::{DateTime, Utc};
use meridian_core::events::{EventEmitter, EventKey, Listener};
use meridian_core::types::{channels, CachedChannelEntry, DataSource};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::protocol::{
    error_message, ActionEnvelope, ActionResponse, ClientEvent, ConnectAuth, DataUpdate, Packet,
    ServerEvent, SocketPacket, SyncKind,
};
use crate::transport::{Connector, SocketLink, WsConnector};

/// Disconnect reason the server uses when it kicks a client.
pub const SERVER_DISCONNECT: &str = "io server disconnect";

/// Reason attached to a link that simply went away.
pub const TRANSPORT_CLOSE: &str = "transport close";

/// Channel name → payload, as carried by `full_sync`.
pub type SyncSnapshot = Map<String, Value>;

/// Channel subscriber callback.
pub type ChannelCallback = Arc<dyn Fn(&CachedChannelEntry) + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Deadlines and endpoint for [`SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// `ws(s)://host/socket.io/?EIO=4&transport=websocket`
    pub endpoint: Url,
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    pub users_sync_timeout: Duration,
    pub action_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Credentials for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub token: String,
    pub user_id: String,
    pub role: Option<String>,
}

// =============================================================================
// Events
// =============================================================================

/// Why the link went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called; carries the caller's reason.
    Manual(String),
    /// The server rejected the session.
    AuthFailed(String),
    /// Network or server-side drop.
    Transport(String),
}

impl DisconnectReason {
    /// Classifies a wire-level disconnect reason.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            SERVER_DISCONNECT | "auth_failed" | "unauthorized" => {
                DisconnectReason::AuthFailed(reason.to_string())
            }
            "io client disconnect" => DisconnectReason::Manual(reason.to_string()),
            other => DisconnectReason::Transport(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Manual(r)
            | DisconnectReason::AuthFailed(r)
            | DisconnectReason::Transport(r) => r,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DisconnectReason::AuthFailed(_))
    }
}

/// Everything the client reports to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connect,
    Disconnect(DisconnectReason),
    Error { kind: ErrorKind, message: String },
    Data(DataUpdate),
    Sync(SyncSnapshot),
    ActionResponse(ActionResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    Connect,
    Disconnect,
    Error,
    Data,
    Sync,
    ActionResponse,
}

impl EventKey for SyncEvent {
    type Kind = SyncEventKind;

    fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::Connect => SyncEventKind::Connect,
            SyncEvent::Disconnect(_) => SyncEventKind::Disconnect,
            SyncEvent::Error { .. } => SyncEventKind::Error,
            SyncEvent::Data(_) => SyncEventKind::Data,
            SyncEvent::Sync(_) => SyncEventKind::Sync,
            SyncEvent::ActionResponse(_) => SyncEventKind::ActionResponse,
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

enum LinkPhase {
    Idle,
    Connecting {
        generation: u64,
        established: Option<oneshot::Sender<SyncResult<()>>>,
    },
    Connected {
        generation: u64,
    },
}

impl LinkPhase {
    fn name(&self) -> &'static str {
        match self {
            LinkPhase::Idle => "idle",
            LinkPhase::Connecting { .. } => "connecting",
            LinkPhase::Connected { .. } => "connected",
        }
    }
}

struct PendingAction {
    action_type: String,
    payload: Value,
}

struct Inner {
    generation: u64,
    phase: LinkPhase,
    authenticated: bool,
    auth: Option<ConnectParams>,
    outgoing: Option<mpsc::UnboundedSender<Packet>>,
    link_cancel: Option<CancellationToken>,

    pending_actions: VecDeque<PendingAction>,
    action_waiters: HashMap<String, oneshot::Sender<SyncResult<Value>>>,
    sync_waiters: Vec<oneshot::Sender<SyncResult<SyncSnapshot>>>,
    users_waiters: Vec<oneshot::Sender<SyncResult<Value>>>,

    cache: HashMap<String, CachedChannelEntry>,
    subscribers: HashMap<String, Vec<(u64, ChannelCallback)>>,
    next_subscriber_id: u64,

    reconnect_attempts: u32,
    last_connection_time: Option<DateTime<Utc>>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            generation: 0,
            phase: LinkPhase::Idle,
            authenticated: false,
            auth: None,
            outgoing: None,
            link_cancel: None,
            pending_actions: VecDeque::new(),
            action_waiters: HashMap::new(),
            sync_waiters: Vec::new(),
            users_waiters: Vec::new(),
            cache: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            reconnect_attempts: 0,
            last_connection_time: None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, LinkPhase::Connected { .. })
    }

    fn send(&self, packet: Packet) -> SyncResult<()> {
        self.outgoing
            .as_ref()
            .ok_or(SyncError::NotConnected)?
            .send(packet)
            .map_err(|_| SyncError::Disconnected)
    }

    fn send_event(&self, event: ClientEvent) -> SyncResult<()> {
        self.send(event.into_packet()?)
    }

    /// Stops the reader and heartbeat tasks and drops the socket.
    fn teardown_link(&mut self) {
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
        self.outgoing = None;
    }

    /// Starts a new generation; waiters of the old one fail with `reason`.
    fn next_generation(&mut self, reason: SyncError) -> u64 {
        self.generation += 1;
        self.fail_waiters(reason);
        self.generation
    }

    fn fail_waiters(&mut self, reason: SyncError) {
        for (_, tx) in self.action_waiters.drain() {
            let _ = tx.send(Err(reason.clone()));
        }
        for tx in self.sync_waiters.drain(..) {
            let _ = tx.send(Err(reason.clone()));
        }
        for tx in self.users_waiters.drain(..) {
            let _ = tx.send(Err(reason.clone()));
        }
    }

    /// Overwrites a channel entry and returns what its subscribers must see.
    fn upsert(&mut self, channel: &str, payload: Value, source: DataSource) -> Effect {
        let entry = CachedChannelEntry::new(payload, source);
        self.cache.insert(channel.to_string(), entry.clone());
        let callbacks = self
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        Effect::Notify { callbacks, entry }
    }
}

/// Work done after the state lock is released.
enum Effect {
    Notify {
        callbacks: Vec<ChannelCallback>,
        entry: CachedChannelEntry,
    },
    Emit(SyncEvent),
}

struct Shared {
    config: SyncClientConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<Inner>,
    events: EventEmitter<SyncEvent>,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn timeout_error(operation: &'static str, after: Duration) -> SyncError {
    SyncError::Timeout {
        operation,
        after_ms: after.as_millis() as u64,
    }
}

/// CONNECT_ERROR messages about credentials are auth failures; the rest are
/// treated as connection problems.
fn classify_connect_error(message: &str) -> SyncError {
    let lower = message.to_lowercase();
    if ["auth", "token", "unauthorized", "forbidden"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        SyncError::AuthRejected(message.to_string())
    } else {
        SyncError::ConnectionFailed(message.to_string())
    }
}

// =============================================================================
// Sync Client
// =============================================================================

/// Realtime sync client. Cheap to clone; clones share one socket.
#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    /// Creates a client that opens sockets through `connector`.
    pub fn new(config: SyncClientConfig, connector: Arc<dyn Connector>) -> Self {
        SyncClient {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(Inner::new()),
                events: EventEmitter::new(),
            }),
        }
    }

    /// Creates a client over real websockets.
    pub fn with_websocket(config: SyncClientConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Opens the socket and performs the authentication handshake.
    ///
    /// Resolves once the server acknowledges the connection. Fails with
    /// [`SyncError::Timeout`] after the connect deadline, with
    /// [`SyncError::Aborted`] when `cancel` fires, and with
    /// [`SyncError::AuthRejected`] if the server drops or refuses the socket
    /// before acknowledging it. A no-op while already connecting or connected.
    pub async fn connect(&self, params: ConnectParams, cancel: CancellationToken) -> SyncResult<()> {
        if params.token.trim().is_empty() {
            return Err(SyncError::InvalidArgument("token is required".into()));
        }
        if params.user_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("userId is required".into()));
        }

        let (generation, established) = {
            let mut inner = self.shared.state.lock();
            if !matches!(inner.phase, LinkPhase::Idle) {
                debug!(phase = inner.phase.name(), "Connect ignored, link already active");
                return Ok(());
            }
            inner.teardown_link();
            let generation = inner.next_generation(SyncError::Aborted);
            let (tx, rx) = oneshot::channel();
            inner.phase = LinkPhase::Connecting {
                generation,
                established: Some(tx),
            };
            inner.auth = Some(params.clone());
            (generation, rx)
        };

        info!(generation, user_id = %params.user_id, "Connecting to realtime server");

        let deadline = self.shared.config.connect_timeout;
        let attempt = self.establish(generation, params, established);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Aborted),
            result = tokio::time::timeout(deadline, attempt) => {
                result.unwrap_or_else(|_| Err(timeout_error("connect", deadline)))
            }
        };

        if let Err(e) = &outcome {
            self.shared.abandon_attempt(generation, e);
        }
        outcome
    }

    async fn establish(
        &self,
        generation: u64,
        params: ConnectParams,
        established: oneshot::Receiver<SyncResult<()>>,
    ) -> SyncResult<()> {
        let SocketLink { outgoing, incoming } =
            self.shared.connector.open(&self.shared.config.endpoint).await?;

        let auth = ConnectAuth {
            token: params.token,
            user_id: params.user_id,
            role: params.role,
            timestamp: now_millis(),
        }
        .into_packet()?;

        {
            let mut inner = self.shared.state.lock();
            if inner.generation != generation {
                return Err(SyncError::Aborted);
            }
            outgoing
                .send(auth)
                .map_err(|_| SyncError::ConnectionFailed("socket closed before handshake".into()))?;

            let link_cancel = CancellationToken::new();
            tokio::spawn(read_loop(
                Arc::downgrade(&self.shared),
                generation,
                incoming,
                link_cancel.clone(),
            ));
            inner.outgoing = Some(outgoing);
            inner.link_cancel = Some(link_cancel);
        }

        established.await.unwrap_or(Err(SyncError::Aborted))
    }

    /// Tears everything down. Safe to call in any state.
    ///
    /// Stops the heartbeat, fails outstanding waiters with
    /// [`SyncError::Aborted`], clears the credentials and emits
    /// `Disconnect(Manual(reason))`. Queued pending actions are kept for the
    /// next connection.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut inner = self.shared.state.lock();
            if let LinkPhase::Connecting { established, .. } = &mut inner.phase {
                if let Some(tx) = established.take() {
                    let _ = tx.send(Err(SyncError::Aborted));
                }
            }
            inner.teardown_link();
            inner.next_generation(SyncError::Aborted);
            inner.phase = LinkPhase::Idle;
            inner.authenticated = false;
            inner.auth = None;
        }

        info!(reason, "Disconnected from realtime server");
        self.shared
            .events
            .emit(&SyncEvent::Disconnect(DisconnectReason::Manual(reason.to_string())));
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Asks for a full snapshot and waits for the next `full_sync`.
    pub async fn request_sync(&self) -> SyncResult<SyncSnapshot> {
        let rx = {
            let mut inner = self.shared.state.lock();
            if !(inner.is_connected() && inner.authenticated) {
                return Err(SyncError::NotConnected);
            }
            inner.sync_waiters.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            inner.send_event(ClientEvent::RequestSync(SyncKind::Manual))?;
            inner.sync_waiters.push(tx);
            rx
        };

        let deadline = self.shared.config.sync_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => Err(timeout_error("request_sync", deadline)),
        }
    }

    /// Asks for the users channel and waits for `data:users`.
    pub async fn request_users_sync(&self) -> SyncResult<Value> {
        let rx = {
            let mut inner = self.shared.state.lock();
            if !(inner.is_connected() && inner.authenticated) {
                return Err(SyncError::NotConnected);
            }
            inner.users_waiters.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            inner.send_event(ClientEvent::RequestSyncUsers)?;
            inner.users_waiters.push(tx);
            rx
        };

        let deadline = self.shared.config.users_sync_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => Err(timeout_error("request_sync_users", deadline)),
        }
    }

    /// Sends an action and waits for its `action_response`.
    ///
    /// While not connected the action is queued for replay on the next
    /// connection and this call fails with [`SyncError::NotConnected`].
    pub async fn send_action(&self, action_type: &str, payload: Value) -> SyncResult<Value> {
        if action_type.trim().is_empty() {
            return Err(SyncError::InvalidArgument("action type is required".into()));
        }

        let (id, rx) = {
            let mut inner = self.shared.state.lock();
            if !inner.is_connected() {
                inner.pending_actions.push_back(PendingAction {
                    action_type: action_type.to_string(),
                    payload,
                });
                debug!(
                    action_type,
                    queued = inner.pending_actions.len(),
                    "Queued action until connected"
                );
                return Err(SyncError::NotConnected);
            }

            let id = Uuid::new_v4().to_string();
            let envelope = ActionEnvelope {
                id: id.clone(),
                action_type: action_type.to_string(),
                payload,
                timestamp: now_millis(),
            };
            inner.send_event(ClientEvent::Action(envelope))?;

            let (tx, rx) = oneshot::channel();
            inner.action_waiters.insert(id.clone(), tx);
            (id, rx)
        };

        debug!(action_type, action_id = %id, "Action sent");

        let deadline = self.shared.config.action_timeout;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.shared.state.lock().action_waiters.remove(&id);
                Err(timeout_error("action", deadline))
            }
        }
    }

    // =========================================================================
    // Subscriptions & Cache
    // =========================================================================

    /// Registers `callback` for `channel`.
    ///
    /// If the channel is cached, the entry is delivered to `callback` before
    /// this returns. Dropping the returned [`Subscription`] removes only this
    /// callback.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&CachedChannelEntry) + Send + Sync + 'static,
    {
        let callback: ChannelCallback = Arc::new(callback);

        let (id, replay) = {
            let mut inner = self.shared.state.lock();
            inner.next_subscriber_id += 1;
            let id = inner.next_subscriber_id;
            inner
                .subscribers
                .entry(channel.to_string())
                .or_default()
                .push((id, callback.clone()));
            (id, inner.cache.get(channel).cloned())
        };

        if let Some(entry) = replay {
            invoke(&callback, &entry);
        }

        Subscription {
            shared: Arc::downgrade(&self.shared),
            channel: channel.to_string(),
            id,
        }
    }

    pub fn get_cached_data(&self, channel: &str) -> Option<CachedChannelEntry> {
        self.shared.state.lock().cache.get(channel).cloned()
    }

    pub fn get_all_cached_data(&self) -> HashMap<String, CachedChannelEntry> {
        self.shared.state.lock().cache.clone()
    }

    /// Wipes every channel. Subscribers stay registered.
    pub fn clear_cache(&self) {
        self.shared.state.lock().cache.clear();
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn on(&self, kind: SyncEventKind, listener: Listener<SyncEvent>) -> bool {
        self.shared.events.on(kind, listener)
    }

    pub fn off(&self, kind: SyncEventKind, listener: &Listener<SyncEvent>) {
        self.shared.events.off(kind, listener)
    }

    pub fn remove_all_listeners(&self, kind: Option<SyncEventKind>) {
        self.shared.events.remove_all_listeners(kind)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.shared.state.lock().phase, LinkPhase::Connecting { .. })
    }

    pub fn is_authenticated(&self) -> bool {
        let inner = self.shared.state.lock();
        inner.is_connected() && inner.authenticated
    }

    /// Failed attempts since the last established connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.state.lock().reconnect_attempts
    }

    /// When the last connection was established.
    pub fn last_connection_time(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().last_connection_time
    }

    pub fn pending_action_count(&self) -> usize {
        self.shared.state.lock().pending_actions.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscribers
            .get(channel)
            .map_or(0, Vec::len)
    }
}

// =============================================================================
// Subscription Guard
// =============================================================================

/// Keeps a channel callback registered until dropped.
#[must_use = "the callback is removed when the Subscription is dropped"]
pub struct Subscription {
    shared: Weak<Shared>,
    channel: String,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Removes the callback now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.state.lock();
        if let Some(subs) = inner.subscribers.get_mut(&self.channel) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                inner.subscribers.remove(&self.channel);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}

fn invoke(callback: &ChannelCallback, entry: &CachedChannelEntry) {
    if catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
        error!("Channel subscriber panicked");
    }
}

// =============================================================================
// Socket Handling
// =============================================================================

impl Shared {
    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify { callbacks, entry } => {
                    for callback in &callbacks {
                        invoke(callback, &entry);
                    }
                }
                Effect::Emit(event) => self.events.emit(&event),
            }
        }
    }

    fn abandon_attempt(&self, generation: u64, error: &SyncError) {
        let mut inner = self.state.lock();
        if inner.generation != generation {
            return;
        }
        if matches!(inner.phase, LinkPhase::Connecting { .. }) {
            inner.phase = LinkPhase::Idle;
        }
        if matches!(inner.phase, LinkPhase::Idle) {
            inner.teardown_link();
            inner.authenticated = false;
        }
        if error.is_abort() {
            debug!(generation, "Connection attempt aborted");
        } else {
            inner.reconnect_attempts += 1;
            warn!(generation, error = %error, "Connection attempt failed");
        }
    }

    fn handle_packet(self: &Arc<Self>, generation: u64, packet: SocketPacket) {
        match packet {
            SocketPacket::Connect(_) => self.on_established(generation),
            SocketPacket::Disconnect => {
                self.on_link_lost(generation, DisconnectReason::from_wire(SERVER_DISCONNECT))
            }
            SocketPacket::ConnectError(err) => {
                let error = classify_connect_error(&error_message(&err));
                self.on_handshake_error(generation, error);
            }
            SocketPacket::Event { name, data } => match ServerEvent::from_event(name, data) {
                Ok(event) => self.on_server_event(generation, event),
                Err(e) => warn!(?e, "Dropping malformed server event"),
            },
            SocketPacket::Ack { id, .. } => debug!(id, "Ignoring ack"),
        }
    }

    fn on_established(self: &Arc<Self>, generation: u64) {
        let mut inner = self.state.lock();
        if inner.generation != generation {
            return;
        }
        let established = match &mut inner.phase {
            LinkPhase::Connecting { established, .. } => established.take(),
            _ => {
                debug!(generation, "Duplicate CONNECT ignored");
                return;
            }
        };

        inner.phase = LinkPhase::Connected { generation };
        inner.authenticated = true;
        inner.reconnect_attempts = 0;
        inner.last_connection_time = Some(Utc::now());

        // Replay before releasing the lock so no new action can overtake
        let replayed = inner.pending_actions.len();
        while let Some(action) = inner.pending_actions.pop_front() {
            let envelope = ActionEnvelope {
                id: Uuid::new_v4().to_string(),
                action_type: action.action_type,
                payload: action.payload,
                timestamp: now_millis(),
            };
            if let Err(e) = inner.send_event(ClientEvent::Action(envelope)) {
                warn!(?e, "Failed to replay pending action");
            }
        }

        if let Some(link_cancel) = &inner.link_cancel {
            tokio::spawn(heartbeat(
                Arc::downgrade(self),
                generation,
                self.config.heartbeat_interval,
                link_cancel.child_token(),
            ));
        }
        drop(inner);

        info!(generation, replayed, "Realtime connection established");
        if let Some(tx) = established {
            let _ = tx.send(Ok(()));
        }
        self.events.emit(&SyncEvent::Connect);
    }

    fn on_handshake_error(&self, generation: u64, error: SyncError) {
        let mut effects = Vec::new();
        {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                return;
            }
            match &mut inner.phase {
                LinkPhase::Connecting { established, .. } => {
                    if let Some(tx) = established.take() {
                        let _ = tx.send(Err(error));
                    }
                    inner.phase = LinkPhase::Idle;
                    inner.teardown_link();
                }
                LinkPhase::Connected { .. } => effects.push(Effect::Emit(SyncEvent::Error {
                    kind: error.kind(),
                    message: error.to_string(),
                })),
                LinkPhase::Idle => {}
            }
        }
        self.run_effects(effects);
    }

    fn on_link_lost(&self, generation: u64, reason: DisconnectReason) {
        let mut effects = Vec::new();
        {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                return;
            }
            let phase = std::mem::replace(&mut inner.phase, LinkPhase::Idle);
            inner.teardown_link();
            inner.authenticated = false;

            match phase {
                LinkPhase::Connecting {
                    established: Some(tx),
                    ..
                } => {
                    let _ = tx.send(Err(SyncError::AuthRejected(format!(
                        "server closed the connection during handshake ({})",
                        reason.as_str()
                    ))));
                }
                LinkPhase::Connected { .. } => {
                    inner.fail_waiters(SyncError::Disconnected);
                    warn!(generation, reason = reason.as_str(), "Realtime connection lost");
                    effects.push(Effect::Emit(SyncEvent::Disconnect(reason)));
                }
                _ => {}
            }
        }
        self.run_effects(effects);
    }

    fn on_server_event(&self, generation: u64, event: ServerEvent) {
        if let ServerEvent::AuthError(message) = event {
            return self.on_handshake_error(generation, SyncError::AuthRejected(message));
        }

        let mut effects = Vec::new();
        {
            let mut inner = self.state.lock();
            if inner.generation != generation {
                return;
            }

            match event {
                ServerEvent::Authenticated(_) => {
                    inner.authenticated = true;
                    info!(generation, "Server acknowledged authentication");
                    if let Err(e) = inner.send_event(ClientEvent::RequestSync(SyncKind::Initial)) {
                        warn!(?e, "Failed to request initial sync");
                    }
                }

                ServerEvent::DataUpdate(update) => {
                    debug!(channel = %update.channel, "Data update");
                    let notify = inner.upsert(&update.channel, update.payload.clone(), DataSource::Realtime);
                    effects.push(notify);
                    effects.push(Effect::Emit(SyncEvent::Data(update)));
                }

                ServerEvent::FullSync(snapshot) => {
                    debug!(channels = snapshot.len(), "Full sync");
                    for (channel, payload) in &snapshot {
                        let notify = inner.upsert(channel, payload.clone(), DataSource::Sync);
                        effects.push(notify);
                    }
                    for tx in inner.sync_waiters.drain(..) {
                        let _ = tx.send(Ok(snapshot.clone()));
                    }
                    effects.push(Effect::Emit(SyncEvent::Sync(snapshot)));
                }

                ServerEvent::UsersData(payload) => {
                    if let Some(message) = users_error(&payload) {
                        warn!(%message, "Users sync failed");
                        for tx in inner.users_waiters.drain(..) {
                            let _ = tx.send(Err(SyncError::ActionFailed(message.clone())));
                        }
                    } else {
                        let notify = inner.upsert(channels::USERS, payload.clone(), DataSource::Realtime);
                        effects.push(notify);
                        for tx in inner.users_waiters.drain(..) {
                            let _ = tx.send(Ok(payload.clone()));
                        }
                    }
                }

                ServerEvent::ActionResponse(response) => {
                    match inner.action_waiters.remove(&response.action_id) {
                        Some(tx) => {
                            let result = if response.success {
                                Ok(response.data.clone().unwrap_or(Value::Null))
                            } else {
                                Err(SyncError::ActionFailed(response.error_message()))
                            };
                            let _ = tx.send(result);
                        }
                        None => debug!(action_id = %response.action_id, "Unmatched action response"),
                    }
                    effects.push(Effect::Emit(SyncEvent::ActionResponse(response)));
                }

                ServerEvent::Pong => debug!("Heartbeat acknowledged"),

                ServerEvent::Unknown { name, .. } => debug!(event = %name, "Ignoring unknown event"),

                ServerEvent::AuthError(_) => {}
            }
        }
        self.run_effects(effects);
    }
}

/// `data:users` reports failures as `{ success: false, error }`.
fn users_error(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;
    if obj.get("success").and_then(Value::as_bool) == Some(false) {
        Some(
            obj.get("error")
                .map(error_message)
                .unwrap_or_else(|| "users sync failed".to_string()),
        )
    } else {
        None
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn read_loop(
    shared: Weak<Shared>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = incoming.recv() => packet,
        };
        let Some(strong) = shared.upgrade() else {
            return;
        };
        match packet {
            Some(Packet::Message(packet)) => strong.handle_packet(generation, packet),
            Some(other) => debug!(?other, "Ignoring engine packet"),
            None => {
                strong.on_link_lost(generation, DisconnectReason::Transport(TRANSPORT_CLOSE.into()));
                return;
            }
        }
    }
}

async fn heartbeat(
    shared: Weak<Shared>,
    generation: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(strong) = shared.upgrade() else {
                    break;
                };
                let inner = strong.state.lock();
                if inner.generation != generation {
                    break;
                }
                if let Err(e) = inner.send_event(ClientEvent::Ping) {
                    debug!(?e, "Heartbeat stopped");
                    break;
                }
            }
        }
    }
}
