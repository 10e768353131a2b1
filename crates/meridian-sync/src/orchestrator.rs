//! # Sync Orchestrator
//!
//! The single authority deciding when the [`SyncClient`] connects. It watches
//! the published [`AuthSnapshot`] and drives the client from it.
//!
//! ## Decision Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Orchestrator Actor Loop                             │
//! │                                                                         │
//! │  auth watch ──┐                                                         │
//! │  client events┤        ┌──────────────────────────────┐                 │
//! │  connect      ├──────► │  is_initializing?  → hold    │                 │
//! │   outcomes    │        │  authenticated+token → connect│                │
//! │  commands ────┤        │  otherwise        → disconnect│                │
//! │  reconnect ───┤        └──────────────────────────────┘                 │
//! │   timer       │                                                         │
//! │  periodic ────┘        ON FAILURE                                       │
//! │   sync tick            ──────────                                       │
//! │                        • auth_error / server kick → force logout        │
//! │                        • transport / timeout      → backoff reconnect   │
//! │                        • manual / abort           → nothing             │
//! │                        • attempts exhausted       → terminal error      │
//! │                                                                         │
//! │  ConnectionState is published on a watch channel after every change.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use meridian_core::events::Listener;
use meridian_core::types::{AuthSnapshot, CachedChannelEntry};
use meridian_core::ForceLogoutReason;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    ConnectParams, DisconnectReason, Subscription, SyncClient, SyncEvent, SyncEventKind,
};
use crate::error::{ErrorKind, SyncError, SyncResult};

// =============================================================================
// Configuration
// =============================================================================

/// Reconnect and re-sync policy.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Reconnects before giving up until the session changes.
    pub max_reconnect_attempts: u32,
    /// Freshness `request_sync` period while connected.
    pub periodic_sync_interval: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            periodic_sync_interval: Some(Duration::from_secs(30)),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// What the UI sees of the realtime connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub connection_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

// =============================================================================
// Reconnect Policy
// =============================================================================

/// `base * 2^n` delays, at most `max_attempts` of them.
pub struct ReconnectPolicy {
    backoff: ExponentialBackoff,
    attempts: u32,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        let ceiling = base_delay.saturating_mul(1u32.checked_shl(max_attempts).unwrap_or(u32::MAX));
        let mut backoff = ExponentialBackoff {
            initial_interval: base_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: ceiling,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();

        ReconnectPolicy {
            backoff,
            attempts: 0,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.backoff.next_backoff()?;
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// =============================================================================
// Session Control
// =============================================================================

/// Lets the orchestrator tear down the session when the server rejects it.
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn force_logout(&self, reason: ForceLogoutReason);
}

/// Ignores forced logouts. Useful when no session is attached.
pub struct NoOpSessionControl;

#[async_trait]
impl SessionControl for NoOpSessionControl {
    async fn force_logout(&self, _reason: ForceLogoutReason) {}
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Shutdown(oneshot::Sender<()>),
}

/// Handle for the running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    client: SyncClient,
    auth: watch::Receiver<AuthSnapshot>,
    state: watch::Receiver<ConnectionState>,
}

impl OrchestratorHandle {
    /// Connects now if the session allows it. Also clears a terminal error.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Drops the connection until the next connect or session change.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// One-shot manual sync. Returns false when not connected, without a
    /// token, or when the request fails.
    pub async fn force_sync(&self) -> bool {
        let connected = self.state.borrow().is_connected;
        let has_token = self.auth.borrow().token().is_some();
        if !connected || !has_token {
            return false;
        }
        match self.client.request_sync().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Manual sync failed");
                false
            }
        }
    }

    /// Sends an action; fails with [`SyncError::NotConnected`] right away
    /// instead of queueing when the connection is down.
    pub async fn send_action(&self, action_type: &str, payload: Value) -> SyncResult<Value> {
        let connected = self.state.borrow().is_connected;
        if !connected {
            return Err(SyncError::NotConnected);
        }
        self.client.send_action(action_type, payload).await
    }

    pub fn subscribe<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&CachedChannelEntry) + Send + Sync + 'static,
    {
        self.client.subscribe(channel, callback)
    }

    pub fn get_cached_data(&self, channel: &str) -> Option<CachedChannelEntry> {
        self.client.get_cached_data(channel)
    }

    pub async fn request_users_sync(&self) -> SyncResult<Value> {
        self.client.request_users_sync().await
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    /// Disconnects, clears timers and aborts any in-flight attempt.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

enum Phase {
    Idle,
    Connecting {
        attempt: u64,
        cancel: CancellationToken,
    },
    Connected,
}

type AuthKey = (bool, bool, Option<String>);

/// Auth-gated connection driver.
pub struct SyncOrchestrator {
    client: SyncClient,
    session: Arc<dyn SessionControl>,
    config: OrchestratorConfig,
    auth_rx: watch::Receiver<AuthSnapshot>,
    state_tx: watch::Sender<ConnectionState>,

    phase: Phase,
    policy: ReconnectPolicy,
    params: Option<ConnectParams>,
    auth_key: Option<AuthKey>,
    connection_error: Option<String>,
    last_sync_time: Option<DateTime<Utc>>,

    attempt_seq: u64,
    attempt_task: Option<JoinHandle<()>>,
    outcome_tx: mpsc::UnboundedSender<(u64, SyncResult<()>)>,
    reconnect_at: Option<Instant>,
    periodic: Option<Interval>,
}

struct Channels {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events_rx: mpsc::UnboundedReceiver<SyncEvent>,
    outcome_rx: mpsc::UnboundedReceiver<(u64, SyncResult<()>)>,
    listener: Listener<SyncEvent>,
}

const EVENT_KINDS: [SyncEventKind; 4] = [
    SyncEventKind::Connect,
    SyncEventKind::Disconnect,
    SyncEventKind::Error,
    SyncEventKind::Sync,
];

impl SyncOrchestrator {
    /// Starts the orchestrator on the current runtime.
    pub fn spawn(
        client: SyncClient,
        auth_rx: watch::Receiver<AuthSnapshot>,
        session: Arc<dyn SessionControl>,
        config: OrchestratorConfig,
    ) -> OrchestratorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let listener: Listener<SyncEvent> = Arc::new(move |event: &SyncEvent| {
            let _ = events_tx.send(event.clone());
        });
        for kind in EVENT_KINDS {
            client.on(kind, listener.clone());
        }

        let handle = OrchestratorHandle {
            cmd_tx,
            client: client.clone(),
            auth: auth_rx.clone(),
            state: state_rx,
        };

        let orchestrator = SyncOrchestrator {
            policy: ReconnectPolicy::new(config.reconnect_base_delay, config.max_reconnect_attempts),
            client,
            session,
            config,
            auth_rx,
            state_tx,
            phase: Phase::Idle,
            params: None,
            auth_key: None,
            connection_error: None,
            last_sync_time: None,
            attempt_seq: 0,
            attempt_task: None,
            outcome_tx,
            reconnect_at: None,
            periodic: None,
        };

        tokio::spawn(orchestrator.run(Channels {
            cmd_rx,
            events_rx,
            outcome_rx,
            listener,
        }));

        handle
    }

    async fn run(mut self, mut channels: Channels) {
        info!("Sync orchestrator started");

        let snapshot = self.auth_rx.borrow_and_update().clone();
        self.on_auth_change(snapshot);

        let ack = loop {
            tokio::select! {
                changed = self.auth_rx.changed() => {
                    if changed.is_err() {
                        debug!("Auth source dropped");
                        break None;
                    }
                    let snapshot = self.auth_rx.borrow_and_update().clone();
                    self.on_auth_change(snapshot);
                }

                Some(event) = channels.events_rx.recv() => self.on_client_event(event),

                Some((attempt, result)) = channels.outcome_rx.recv() => {
                    self.on_connect_outcome(attempt, result);
                }

                cmd = channels.cmd_rx.recv() => match cmd {
                    Some(Command::Connect) => {
                        self.policy.reset();
                        self.connection_error = None;
                        self.connect();
                    }
                    Some(Command::Disconnect) => self.disconnect_link("manual"),
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },

                _ = tokio::time::sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)),
                    if self.reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.connect();
                }

                _ = next_tick(&mut self.periodic) => self.periodic_sync(),
            }
        };

        self.disconnect_link("shutdown");
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        for kind in EVENT_KINDS {
            self.client.off(kind, &channels.listener);
        }
        info!("Sync orchestrator stopped");

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    // =========================================================================
    // Auth Gate
    // =========================================================================

    fn on_auth_change(&mut self, snapshot: AuthSnapshot) {
        let key: AuthKey = (
            snapshot.is_initializing,
            snapshot.is_authenticated(),
            snapshot.token().map(str::to_string),
        );
        if self.auth_key.as_ref() == Some(&key) {
            return;
        }
        let token_changed = self
            .auth_key
            .as_ref()
            .is_some_and(|(_, _, token)| token.is_some() && *token != key.2);
        self.auth_key = Some(key);

        if snapshot.is_initializing {
            debug!("Auth still initializing, holding connection");
            return;
        }

        self.policy.reset();
        self.connection_error = None;

        let params = match (&snapshot.user, snapshot.is_authenticated()) {
            (Some(user), true) => user.token.as_ref().map(|token| ConnectParams {
                token: token.clone(),
                user_id: user.id.clone(),
                role: Some(user.role.as_str().to_string()),
            }),
            _ => None,
        };

        match params {
            Some(params) => {
                self.params = Some(params);
                if token_changed && !matches!(self.phase, Phase::Idle) {
                    info!("Session token changed, reconnecting");
                    self.disconnect_link("token changed");
                }
                self.connect();
            }
            None => {
                self.params = None;
                self.disconnect_link("unauthenticated");
            }
        }
    }

    // =========================================================================
    // Connection Driving
    // =========================================================================

    fn connect(&mut self) {
        match self.phase {
            Phase::Connecting { .. } => {
                debug!("Connection attempt already in flight");
                return;
            }
            Phase::Connected => return,
            Phase::Idle => {}
        }
        let Some(params) = self.params.clone() else {
            debug!("No session token, not connecting");
            return;
        };

        self.reconnect_at = None;
        self.attempt_seq += 1;
        let attempt = self.attempt_seq;
        let cancel = CancellationToken::new();

        let previous = self.attempt_task.take();
        let client = self.client.clone();
        let outcome_tx = self.outcome_tx.clone();
        let token = cancel.clone();
        self.attempt_task = Some(tokio::spawn(async move {
            // Let a superseded attempt finish unwinding first
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = client.connect(params, token).await;
            let _ = outcome_tx.send((attempt, result));
        }));

        debug!(attempt, "Connection attempt started");
        self.phase = Phase::Connecting { attempt, cancel };
        self.publish();
    }

    fn on_connect_outcome(&mut self, attempt: u64, result: SyncResult<()>) {
        match &self.phase {
            Phase::Connecting { attempt: current, .. } if *current == attempt => {}
            _ => {
                debug!(attempt, "Ignoring stale connect outcome");
                return;
            }
        }

        match result {
            Ok(()) => self.on_connected(),
            Err(e) if e.is_abort() => {
                self.phase = Phase::Idle;
                self.publish();
            }
            Err(e) if e.is_auth_error() => {
                self.phase = Phase::Idle;
                self.force_logout(ForceLogoutReason::TokenInvalid, e.to_string());
            }
            Err(e) => {
                self.phase = Phase::Idle;
                self.schedule_reconnect(e.to_string());
            }
        }
    }

    fn on_connected(&mut self) {
        if matches!(self.phase, Phase::Connected) {
            return;
        }
        self.phase = Phase::Connected;
        self.policy.reset();
        self.connection_error = None;
        self.reconnect_at = None;
        self.periodic = self.config.periodic_sync_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        info!("Realtime sync connected");
        self.publish();
    }

    fn on_client_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connect => {
                if self.params.is_none() {
                    debug!("Connected without a session, dropping link");
                    self.client.disconnect("unauthenticated");
                    return;
                }
                if self.client.is_connected() {
                    self.on_connected();
                }
            }

            SyncEvent::Disconnect(reason) => {
                let was_connected = matches!(self.phase, Phase::Connected);
                if was_connected {
                    self.phase = Phase::Idle;
                    self.periodic = None;
                }
                match reason {
                    DisconnectReason::Manual(_) => self.publish(),
                    DisconnectReason::AuthFailed(wire) => {
                        let reason = match wire.as_str() {
                            "unauthorized" => ForceLogoutReason::TokenInvalid,
                            _ => ForceLogoutReason::SessionExpired,
                        };
                        self.force_logout(reason, format!("Disconnected by server: {}", wire));
                    }
                    DisconnectReason::Transport(wire) if was_connected => {
                        self.schedule_reconnect(format!("Connection lost: {}", wire));
                    }
                    DisconnectReason::Transport(_) => self.publish(),
                }
            }

            SyncEvent::Error { kind: ErrorKind::AuthError, message } => {
                self.force_logout(ForceLogoutReason::TokenInvalid, message);
            }

            SyncEvent::Error { kind, message } => {
                warn!(%kind, %message, "Realtime client error");
            }

            SyncEvent::Sync(_) => {
                self.last_sync_time = Some(Utc::now());
                self.publish();
            }

            SyncEvent::Data(_) | SyncEvent::ActionResponse(_) => {}
        }
    }

    fn schedule_reconnect(&mut self, error: String) {
        if self.params.is_none() {
            self.publish();
            return;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                warn!(
                    attempt = self.policy.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.connection_error = Some(error);
            }
            None => {
                error!(
                    attempts = self.policy.attempts(),
                    %error,
                    "Giving up on realtime connection"
                );
                self.reconnect_at = None;
                self.connection_error = Some(format!(
                    "Unable to connect after {} attempts: {}",
                    self.policy.attempts(),
                    error
                ));
            }
        }
        self.publish();
    }

    fn force_logout(&mut self, reason: ForceLogoutReason, message: String) {
        warn!(%reason, %message, "Server rejected the session, forcing logout");
        self.reconnect_at = None;
        self.connection_error = Some(message);
        self.disconnect_link("auth_failed");

        let session = self.session.clone();
        tokio::spawn(async move {
            session.force_logout(reason).await;
        });
    }

    fn disconnect_link(&mut self, reason: &str) {
        self.reconnect_at = None;
        self.periodic = None;

        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        if let Phase::Connecting { cancel, .. } = &previous {
            cancel.cancel();
        }
        let active = !matches!(previous, Phase::Idle)
            || self.client.is_connected()
            || self.client.is_connecting();
        if active {
            self.client.disconnect(reason);
        }
        self.publish();
    }

    fn periodic_sync(&self) {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.request_sync().await {
                debug!(error = %e, "Periodic sync failed");
            }
        });
    }

    fn publish(&self) {
        let state = ConnectionState {
            is_connected: matches!(self.phase, Phase::Connected),
            is_connecting: matches!(self.phase, Phase::Connecting { .. }),
            connection_error: self.connection_error.clone(),
            last_sync_time: self.last_sync_time,
            reconnect_attempts: self.policy.attempts(),
        };
        self.state_tx.send_if_modified(move |current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
