//! # Client Configuration
//!
//! Configuration management for the realtime client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     MERIDIAN_API_URL=https://erp.example.com/api                       │
//! │     MERIDIAN_SOCKET_URL=https://erp.example.com                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/meridian/client.toml (Linux)                             │
//! │     ~/Library/Application Support/io.meridian.client/client.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     localhost:3001, 10s timeouts, 1s × 5 reconnect backoff             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # client.toml
//! [server]
//! api_url = "https://erp.example.com/api"
//! socket_url = "https://erp.example.com"
//!
//! [transport]
//! connect_timeout_ms = 10000
//! heartbeat_interval_ms = 25000
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_attempts = 5
//!
//! [sync]
//! periodic_sync_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::SyncClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::OrchestratorConfig;
use crate::transport::websocket_endpoint;

// =============================================================================
// Server Settings
// =============================================================================

/// Where the backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the REST API (auth endpoints hang off it).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL of the realtime server (http(s) or ws(s)).
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Engine path on the realtime server.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

fn default_api_url() -> String {
    "http://localhost:3001/api".to_string()
}
fn default_socket_url() -> String {
    "http://localhost:3001".to_string()
}
fn default_socket_path() -> String {
    "/socket.io/".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            api_url: default_api_url(),
            socket_url: default_socket_url(),
            socket_path: default_socket_path(),
        }
    }
}

// =============================================================================
// Transport Settings
// =============================================================================

/// Per-operation deadlines and the heartbeat period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Users sync replies are larger; this deadline is longer.
    #[serde(default = "default_users_sync_timeout")]
    pub users_sync_timeout_ms: u64,

    #[serde(default = "default_action_timeout")]
    pub action_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10_000
}
fn default_sync_timeout() -> u64 {
    10_000
}
fn default_users_sync_timeout() -> u64 {
    15_000
}
fn default_action_timeout() -> u64 {
    10_000
}
fn default_heartbeat_interval() -> u64 {
    25_000
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            connect_timeout_ms: default_connect_timeout(),
            sync_timeout_ms: default_sync_timeout(),
            users_sync_timeout_ms: default_users_sync_timeout(),
            action_timeout_ms: default_action_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

// =============================================================================
// Reconnect Settings
// =============================================================================

/// Exponential backoff: attempt `n` waits `base_delay_ms * 2^n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Attempts before giving up until the session changes.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        ReconnectSettings {
            base_delay_ms: default_base_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Period of the freshness `request_sync` while connected (0 = off).
    #[serde(default = "default_periodic_sync")]
    pub periodic_sync_secs: u64,
}

fn default_periodic_sync() -> u64 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            periodic_sync_secs: default_periodic_sync(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Credentials file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl MeridianConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (client.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let api = Url::parse(&self.server.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.server.api_url
            )));
        }

        websocket_endpoint(&self.server.socket_url, &self.server.socket_path)?;

        let t = &self.transport;
        for (name, value) in [
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("sync_timeout_ms", t.sync_timeout_ms),
            ("users_sync_timeout_ms", t.users_sync_timeout_ms),
            ("action_timeout_ms", t.action_timeout_ms),
            ("heartbeat_interval_ms", t.heartbeat_interval_ms),
            ("base_delay_ms", self.reconnect.base_delay_ms),
        ] {
            if value == 0 {
                return Err(SyncError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MERIDIAN_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.server.api_url = url;
        }

        if let Ok(url) = std::env::var("MERIDIAN_SOCKET_URL") {
            debug!(url = %url, "Overriding socket URL from environment");
            self.server.socket_url = url;
        }

        if let Ok(ms) = std::env::var("MERIDIAN_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.transport.connect_timeout_ms = ms;
            }
        }

        if let Ok(ms) = std::env::var("MERIDIAN_RECONNECT_BASE_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.reconnect.base_delay_ms = ms;
            }
        }

        if let Ok(attempts) = std::env::var("MERIDIAN_RECONNECT_MAX_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(n) => self.reconnect.max_attempts = n,
                Err(_) => warn!(value = %attempts, "Ignoring invalid MERIDIAN_RECONNECT_MAX_ATTEMPTS"),
            }
        }

        if let Ok(secs) = std::env::var("MERIDIAN_PERIODIC_SYNC_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.sync.periodic_sync_secs = secs;
            }
        }

        if let Ok(path) = std::env::var("MERIDIAN_CREDENTIALS_PATH") {
            self.storage.credentials_path = Some(PathBuf::from(path));
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("io", "meridian", "client")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("client.toml"))
    }

    // =========================================================================
    // Derived Component Configs
    // =========================================================================

    /// Credentials file location (explicit or platform default).
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.storage.credentials_path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("credentials.json"))
        })
    }

    pub fn api_base(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.server.api_url)?)
    }

    pub fn client_config(&self) -> SyncResult<SyncClientConfig> {
        let t = &self.transport;
        Ok(SyncClientConfig {
            endpoint: websocket_endpoint(&self.server.socket_url, &self.server.socket_path)?,
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            sync_timeout: Duration::from_millis(t.sync_timeout_ms),
            users_sync_timeout: Duration::from_millis(t.users_sync_timeout_ms),
            action_timeout: Duration::from_millis(t.action_timeout_ms),
            heartbeat_interval: Duration::from_millis(t.heartbeat_interval_ms),
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            reconnect_base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_reconnect_attempts: self.reconnect.max_attempts,
            periodic_sync_interval: match self.sync.periodic_sync_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}
