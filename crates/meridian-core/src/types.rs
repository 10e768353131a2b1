//! # Shared Types
//!
//! Plain data shared by the session and the realtime client.
//!
//! ```text
//! ┌───────────────────┐       ┌──────────────────────┐
//! │   AuthSnapshot    │       │ CachedChannelEntry   │
//! │ state             │       │ payload   (JSON)     │
//! │ is_initializing   │       │ timestamp            │
//! │ user ─────────┐   │       │ source realtime|sync │
//! └───────────────┼───┘       └──────────────────────┘
//!                 ▼
//!          ┌────────────┐
//!          │    User    │  id, email, name, role, status,
//!          │            │  token, permissions (+ opaque extras)
//!          └────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::auth_state::AuthState;

// =============================================================================
// Roles
// =============================================================================

/// Application role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Employee,
    Client,
    /// Any role this client does not know about. Grants nothing.
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Employee => "employee",
            Role::Client => "client",
            Role::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "employee" => Ok(Role::Employee),
            "client" => Ok(Role::Client),
            _ => Err(crate::error::CoreError::UnknownRole(s.to_string())),
        }
    }
}

// =============================================================================
// User Profile
// =============================================================================

/// Profile of the signed-in user.
///
/// Fields the client does not interpret are kept in `extra` so a profile
/// survives a persist/restore cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl User {
    /// Returns a copy carrying `token`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// ORM-backed ids arrive as numbers; the client treats them as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

// =============================================================================
// Auth Snapshot
// =============================================================================

/// Published view of the session, observed by the sync orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub is_initializing: bool,
    pub user: Option<User>,
}

impl Default for AuthSnapshot {
    fn default() -> Self {
        AuthSnapshot {
            state: AuthState::Initializing,
            is_initializing: true,
            user: None,
        }
    }
}

impl AuthSnapshot {
    /// `state == AUTHENTICATED` and a user with a token is present.
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated && self.token().is_some()
    }

    /// The current bearer token, if any.
    pub fn token(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.token.as_deref())
    }
}

// =============================================================================
// Channel Cache
// =============================================================================

/// Well-known channel names pushed by the server.
pub mod channels {
    pub const USERS: &str = "users";
    pub const ORDERS: &str = "orders";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const PRODUCTS: &str = "products";
    pub const STATS: &str = "stats";
}

/// Where a cached payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Incremental `data_update` push (or `data:users` reply).
    Realtime,
    /// Multi-channel `full_sync` snapshot.
    Sync,
}

/// Last known payload of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedChannelEntry {
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub source: DataSource,
}

impl CachedChannelEntry {
    pub fn new(payload: Value, source: DataSource) -> Self {
        CachedChannelEntry {
            payload,
            timestamp: Utc::now(),
            source,
        }
    }
}
