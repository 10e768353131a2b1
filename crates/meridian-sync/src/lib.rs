//! # meridian-sync: Realtime Sync Client for Meridian
//!
//! Everything that touches the network: the Socket.IO client, the HTTP auth
//! backend, the persisted session and the orchestrator that keeps the socket
//! in step with the session.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Auth-Gated Sync Pipeline                          │
//! │                                                                         │
//! │  ┌──────────────┐  watch<AuthSnapshot>  ┌──────────────────────────┐   │
//! │  │ AuthSession  │──────────────────────►│    SyncOrchestrator      │   │
//! │  │              │                       │                          │   │
//! │  │ init/login/  │◄── force_logout ──────│ holds while initializing │   │
//! │  │ logout       │                       │ connect / backoff        │   │
//! │  └──────┬───────┘                       │ periodic request_sync    │   │
//! │         │                               └────────────┬─────────────┘   │
//! │  ┌──────▼───────┐  ┌──────────────┐                  │                 │
//! │  │ AuthBackend  │  │ Credential   │     ┌────────────▼─────────────┐   │
//! │  │ (reqwest)    │  │ Store (JSON) │     │       SyncClient          │   │
//! │  └──────────────┘  └──────────────┘     │ cache • subscribers •     │   │
//! │                                         │ pending actions • waiters │   │
//! │                                         └────────────┬─────────────┘   │
//! │                                                      │                 │
//! │  ┌──────────────┐                       ┌────────────▼─────────────┐   │
//! │  │ Feeds        │◄── subscribe/cache ───│ Transport (Connector)    │   │
//! │  │ users/orders │                       │ Engine.IO v4 over WS     │   │
//! │  └──────────────┘                       └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`session`] - `AuthSession` lifecycle and permission queries
//! - [`orchestrator`] - `SyncOrchestrator` actor and `ConnectionState`
//! - [`client`] - `SyncClient` (socket, cache, subscriptions, actions)
//! - [`feeds`] - Per-channel observable feeds
//! - [`backend`] - HTTP auth endpoints
//! - [`credentials`] - Persisted session storage
//! - [`protocol`] - Engine.IO / Socket.IO codec and typed events
//! - [`transport`] - `Connector` trait and the WebSocket connector
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `SyncError` and the `ErrorKind` taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meridian_sync::*;
//!
//! let config = MeridianConfig::load(None)?;
//! let backend = Arc::new(HttpAuthBackend::new(config.api_base()?)?);
//! let store = Arc::new(FileCredentialStore::new(path));
//! let session = AuthSession::new(backend, store);
//!
//! let client = SyncClient::with_websocket(config.client_config()?);
//! let sync = SyncOrchestrator::spawn(
//!     client,
//!     session.watch(),
//!     Arc::new(session.clone()),
//!     config.orchestrator_config(),
//! );
//!
//! session.initialize().await;
//! let orders = orders_feed(&sync);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod feeds;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{AuthBackend, HttpAuthBackend, LoginResponse};
pub use client::{
    ConnectParams, DisconnectReason, Subscription, SyncClient, SyncClientConfig, SyncEvent,
    SyncEventKind, SyncSnapshot,
};
pub use config::MeridianConfig;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoredCredentials};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use feeds::{
    notifications_feed, orders_feed, products_feed, stats_feed, users_feed, FeedState,
    RealtimeFeed, UsersFeed,
};
pub use orchestrator::{
    ConnectionState, NoOpSessionControl, OrchestratorConfig, OrchestratorHandle,
    ReconnectPolicy, SessionControl, SyncOrchestrator,
};
pub use session::{AuthEvent, AuthEventKind, AuthSession, LoginOutcome};
pub use transport::{Connector, SocketLink, WsConnector};
