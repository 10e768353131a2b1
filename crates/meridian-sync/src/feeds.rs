//! # Realtime Feeds
//!
//! One background task per channel that turns connection state, pushes and
//! the cache into a single observable [`FeedState`].
//!
//! ```text
//!   ConnectionState ──► wait connected ──► subscribe(channel) ──► pushes ─┐
//!        ▲                                   │                            │
//!        │                                   └─► cache double-check ──────┤
//!        │                                                                ▼
//!        └── disconnected: drop subscription, is_loading = true ◄── FeedState
//! ```
//!
//! The users feed also asks for `request_sync_users` when neither a push nor
//! the cache produced data.

use chrono::{DateTime, Utc};
use meridian_core::{channels, CachedChannelEntry};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::orchestrator::OrchestratorHandle;

/// What a feed currently knows about its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedState {
    /// Last payload seen. Kept across disconnects.
    pub data: Option<Value>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for FeedState {
    fn default() -> Self {
        FeedState {
            data: None,
            is_loading: true,
            error: None,
            updated_at: None,
        }
    }
}

// =============================================================================
// Feed
// =============================================================================

/// Live view of one channel. Stops when dropped.
pub struct RealtimeFeed {
    channel: &'static str,
    state: watch::Receiver<FeedState>,
    cancel: CancellationToken,
}

impl RealtimeFeed {
    fn spawn(
        sync: &OrchestratorHandle,
        channel: &'static str,
        fetch_users: bool,
    ) -> (Self, Arc<watch::Sender<FeedState>>) {
        let (tx, rx) = watch::channel(FeedState::default());
        let tx = Arc::new(tx);
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            channel,
            fetch_users,
            sync.clone(),
            tx.clone(),
            cancel.clone(),
        ));

        let feed = RealtimeFeed {
            channel,
            state: rx,
            cancel,
        };
        (feed, tx)
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    /// Stops the background task and releases the subscription.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Users feed with a manual retry.
pub struct UsersFeed {
    feed: RealtimeFeed,
    sync: OrchestratorHandle,
    tx: Arc<watch::Sender<FeedState>>,
}

impl UsersFeed {
    /// Requests the users channel again and waits for the reply.
    pub async fn sync_users(&self) -> SyncResult<Value> {
        fetch_users(&self.sync, &self.tx).await
    }
}

impl Deref for UsersFeed {
    type Target = RealtimeFeed;

    fn deref(&self) -> &RealtimeFeed {
        &self.feed
    }
}

// =============================================================================
// Constructors
// =============================================================================

pub fn users_feed(sync: &OrchestratorHandle) -> UsersFeed {
    let (feed, tx) = RealtimeFeed::spawn(sync, channels::USERS, true);
    UsersFeed {
        feed,
        sync: sync.clone(),
        tx,
    }
}

pub fn orders_feed(sync: &OrchestratorHandle) -> RealtimeFeed {
    RealtimeFeed::spawn(sync, channels::ORDERS, false).0
}

pub fn notifications_feed(sync: &OrchestratorHandle) -> RealtimeFeed {
    RealtimeFeed::spawn(sync, channels::NOTIFICATIONS, false).0
}

pub fn products_feed(sync: &OrchestratorHandle) -> RealtimeFeed {
    RealtimeFeed::spawn(sync, channels::PRODUCTS, false).0
}

pub fn stats_feed(sync: &OrchestratorHandle) -> RealtimeFeed {
    RealtimeFeed::spawn(sync, channels::STATS, false).0
}

// =============================================================================
// Feed Task
// =============================================================================

async fn run(
    channel: &'static str,
    users: bool,
    sync: OrchestratorHandle,
    tx: Arc<watch::Sender<FeedState>>,
    cancel: CancellationToken,
) {
    let mut connection = sync.watch_state();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            ready = connection.wait_for(|s| s.is_connected) => {
                if ready.is_err() {
                    break;
                }
            }
        }

        let (updates_tx, mut updates) = mpsc::unbounded_channel();
        let subscription = sync.subscribe(channel, move |entry: &CachedChannelEntry| {
            let _ = updates_tx.send(entry.clone());
        });
        debug!(channel, "Feed subscribed");

        if let Some(entry) = sync.get_cached_data(channel) {
            apply(&tx, &entry);
        }
        if users && tx.borrow().data.is_none() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = fetch_users(&sync, &tx) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Users sync failed");
                    }
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(entry) = updates.recv() => apply(&tx, &entry),
                changed = connection.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !connection.borrow_and_update().is_connected {
                        break;
                    }
                }
            }
        }

        drop(subscription);
        debug!(channel, "Feed waiting for connection");
        tx.send_modify(|s| s.is_loading = true);
    }
}

fn apply(tx: &watch::Sender<FeedState>, entry: &CachedChannelEntry) {
    tx.send_modify(|s| {
        s.data = Some(entry.payload.clone());
        s.is_loading = false;
        s.error = None;
        s.updated_at = Some(entry.timestamp);
    });
}

async fn fetch_users(
    sync: &OrchestratorHandle,
    tx: &watch::Sender<FeedState>,
) -> SyncResult<Value> {
    tx.send_modify(|s| {
        s.is_loading = true;
        s.error = None;
    });
    let result = sync.request_users_sync().await;
    tx.send_modify(|s| {
        s.is_loading = false;
        match &result {
            Ok(users) => {
                s.data = Some(users.clone());
                s.updated_at = Some(Utc::now());
            }
            Err(e) => s.error = Some(e.to_string()),
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{SyncClient, SyncClientConfig};
    use crate::error::SyncError;
    use crate::orchestrator::{NoOpSessionControl, OrchestratorConfig, SyncOrchestrator};
    use crate::transport::memory::{MemoryConnector, MemoryServer};
    use crate::transport::websocket_endpoint;
    use meridian_core::{AuthSnapshot, AuthState, DataSource, User};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        sync: OrchestratorHandle,
        auth_tx: watch::Sender<AuthSnapshot>,
        servers: mpsc::UnboundedReceiver<MemoryServer>,
    }

    fn authenticated() -> AuthSnapshot {
        let user = serde_json::from_value::<User>(json!({
            "id": 5,
            "email": "ops@example.com",
            "role": "admin"
        }))
        .unwrap()
        .with_token("feed-token");
        AuthSnapshot {
            state: AuthState::Authenticated,
            is_initializing: false,
            user: Some(user),
        }
    }

    fn harness(initial: AuthSnapshot) -> Harness {
        let (connector, servers) = MemoryConnector::new();
        let config = SyncClientConfig {
            endpoint: websocket_endpoint("http://localhost:3001", "/socket.io/").unwrap(),
            connect_timeout: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(1),
            users_sync_timeout: Duration::from_secs(2),
            action_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(25),
        };
        let (auth_tx, auth_rx) = watch::channel(initial);
        let sync = SyncOrchestrator::spawn(
            SyncClient::new(config, connector),
            auth_rx,
            Arc::new(NoOpSessionControl),
            OrchestratorConfig {
                periodic_sync_interval: None,
                ..OrchestratorConfig::default()
            },
        );
        Harness {
            sync,
            auth_tx,
            servers,
        }
    }

    async fn connect(h: &mut Harness) -> MemoryServer {
        let mut server = h.servers.recv().await.unwrap();
        server.handshake().await;
        h.sync
            .watch_state()
            .wait_for(|s| s.is_connected)
            .await
            .unwrap();
        server
    }

    async fn wait_for(feed: &RealtimeFeed, pred: impl FnMut(&FeedState) -> bool) -> FeedState {
        let mut rx = feed.watch();
        let state = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(pred))
            .await
            .expect("feed state not reached")
            .unwrap()
            .clone();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_while_disconnected() {
        let mut signed_out = authenticated();
        signed_out.state = AuthState::Unauthenticated;
        signed_out.user = None;
        let h = harness(signed_out);

        let feed = orders_feed(&h.sync);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(feed.state(), FeedState::default());
        assert_eq!(feed.channel(), "orders");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushes_update_feed() {
        let mut h = harness(authenticated());
        let feed = orders_feed(&h.sync);
        let server = connect(&mut h).await;

        // Let the feed subscribe before pushing
        tokio::time::sleep(Duration::from_millis(10)).await;

        let orders = json!({"orders": [{"id": "o1"}, {"id": "o2"}, {"id": "o3"}]});
        server.emit("data_update", json!({"type": "orders", "payload": orders.clone()}));
        let state = wait_for(&feed, |s| s.data.is_some()).await;
        assert_eq!(state.data, Some(orders));
        assert!(!state.is_loading);
        assert!(state.updated_at.is_some());
        assert_eq!(
            h.sync.get_cached_data("orders").unwrap().source,
            DataSource::Realtime
        );

        // Other channels do not leak in
        server.emit("data_update", json!({"type": "products", "payload": []}));
        server.emit("data_update", json!({"type": "orders", "payload": [{"id": "o4"}]}));
        let state = wait_for(&feed, |s| s.data == Some(json!([{"id": "o4"}]))).await;
        assert!(!state.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_data_and_reloads() {
        let mut h = harness(authenticated());
        let feed = stats_feed(&h.sync);
        let server = connect(&mut h).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        server.emit("full_sync", json!({"stats": {"total": 3}}));
        wait_for(&feed, |s| s.data.is_some()).await;

        let mut signed_out = authenticated();
        signed_out.state = AuthState::Unauthenticated;
        signed_out.user = None;
        h.auth_tx.send(signed_out).unwrap();

        let state = wait_for(&feed, |s| s.is_loading).await;
        assert_eq!(state.data, Some(json!({"total": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_channel_delivered_on_subscribe() {
        let mut h = harness(authenticated());
        let server = connect(&mut h).await;
        server.emit("full_sync", json!({"notifications": [{"id": "n1"}]}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.sync.get_cached_data("notifications").is_some());

        let feed = notifications_feed(&h.sync);
        let state = wait_for(&feed, |s| s.data.is_some()).await;
        assert_eq!(state.data, Some(json!([{"id": "n1"}])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_feed_requests_sync_when_empty() {
        let mut h = harness(authenticated());
        let feed = users_feed(&h.sync);
        let mut server = connect(&mut h).await;

        let (name, _) = server.next_event().await.unwrap();
        assert_eq!(name, "request_sync_users");
        server.emit("data:users", json!([{"id": 1}, {"id": 2}]));

        let state = wait_for(&feed, |s| s.data.is_some()).await;
        assert_eq!(state.data, Some(json!([{"id": 1}, {"id": 2}])));
        assert!(state.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_feed_skips_request_when_cached() {
        let mut h = harness(authenticated());
        let mut server = connect(&mut h).await;
        server.emit("full_sync", json!({"users": [{"id": 9}]}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let feed = users_feed(&h.sync);
        wait_for(&feed, |s| s.data.is_some()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(server.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_users_reports_errors() {
        let mut h = harness(authenticated());
        let mut server = connect(&mut h).await;
        server.emit("full_sync", json!({"users": []}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let feed = users_feed(&h.sync);
        wait_for(&feed, |s| s.data.is_some()).await;

        let (manual, ()) = tokio::join!(feed.sync_users(), async {
            let (name, _) = server.next_event().await.unwrap();
            assert_eq!(name, "request_sync_users");
            server.emit("data:users", json!({"success": false, "error": "forbidden"}));
        });
        assert!(matches!(manual, Err(SyncError::ActionFailed(_))));
        assert_eq!(feed.state().error.as_deref(), Some("Action failed: forbidden"));
        assert!(!feed.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_feed_releases_subscription() {
        let mut h = harness(authenticated());
        let _server = connect(&mut h).await;
        let feed = products_feed(&h.sync);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.sync.client().subscriber_count("products"), 1);

        drop(feed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.sync.client().subscriber_count("products"), 0);
    }
}
