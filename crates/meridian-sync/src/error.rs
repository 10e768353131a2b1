//! # Sync Error Types
//!
//! Error types for the realtime client.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidPacket          │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Serialization          │ │
//! │  │  ConfigLoad/Save│  │  WebSocket      │  │  ActionFailed           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Session      │  │   Deadlines     │  │      Caller             │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  AuthRejected   │  │  Timeout        │  │  InvalidArgument        │ │
//! │  │  Http / Storage │  │  Aborted        │  │  NotConnected           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Every variant maps onto one ErrorKind:                                │
//! │  auth_error │ connection_error │ timeout │ abort │ other               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Error Taxonomy
// =============================================================================

/// Policy class of an error, used by the orchestrator to decide between
/// reconnecting, forcing a logout and doing nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials rejected. Terminal for the connection; never retried.
    AuthError,
    /// Transient network failure. Eligible for backoff reconnection.
    ConnectionError,
    /// An operation's own deadline elapsed.
    Timeout,
    /// Caller-initiated cancellation. Not a failure.
    Abort,
    /// Anything else (caller misuse, config, storage).
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::AuthError => write!(f, "auth_error"),
            ErrorKind::ConnectionError => write!(f, "connection_error"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Abort => write!(f, "abort"),
            ErrorKind::Other => write!(f, "other"),
        }
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all possible client failures.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// A required argument was missing or empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation needs an established, authenticated connection.
    #[error("Not connected to the realtime server")]
    NotConnected,

    // =========================================================================
    // Deadlines & Cancellation
    // =========================================================================
    /// An operation did not complete before its deadline.
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    /// The caller cancelled the operation.
    #[error("Operation aborted")]
    Aborted,

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// The server refused the connection credentials.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// HTTP request to the auth backend failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The backend answered with an error status.
    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Persisted credential storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the socket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Socket closed underneath an operation.
    #[error("Disconnected from realtime server")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// A frame could not be decoded.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// JSON (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The server reported `success: false` for an action.
    #[error("Action failed: {0}")]
    ActionFailed(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocket(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::ConnectionFailed(tls.to_string()),
            other => SyncError::WebSocket(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Serialization(err.to_string())
        } else {
            SyncError::Http(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Maps this error onto the policy taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::AuthRejected(_) => ErrorKind::AuthError,
            SyncError::Api { status, .. } if *status == 401 || *status == 403 => {
                ErrorKind::AuthError
            }
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::WebSocket(_)
            | SyncError::InvalidPacket(_)
            | SyncError::Http(_) => ErrorKind::ConnectionError,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::Aborted => ErrorKind::Abort,
            _ => ErrorKind::Other,
        }
    }

    /// Returns true if reconnecting with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConnectionError | ErrorKind::Timeout)
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind() == ErrorKind::AuthError
    }

    /// Returns true for caller cancellation, which is never a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, SyncError::Aborted)
    }
}
