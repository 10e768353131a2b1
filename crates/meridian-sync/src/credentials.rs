//! # Credential Storage
//!
//! Persists the session between runs under the keys `accessToken`,
//! `currentUser` and `refreshToken`. Read at init, written at login, cleared
//! at logout.

use meridian_core::User;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// What survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl StoredCredentials {
    /// Token and user, when both are present.
    pub fn session(&self) -> Option<(&str, &User)> {
        match (&self.access_token, &self.current_user) {
            (Some(token), Some(user)) if !token.is_empty() => Some((token, user)),
            _ => None,
        }
    }
}

/// Where credentials live.
pub trait CredentialStore: Send + Sync {
    /// Missing storage reads as empty credentials.
    fn load(&self) -> SyncResult<StoredCredentials>;
    fn save(&self, credentials: &StoredCredentials) -> SyncResult<()>;
    fn clear(&self) -> SyncResult<()>;
}

// =============================================================================
// File Store
// =============================================================================

/// JSON file store.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCredentialStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> SyncResult<StoredCredentials> {
        if !self.path.exists() {
            return Ok(StoredCredentials::default());
        }
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            SyncError::Storage(format!("corrupted credentials at {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, credentials: &StoredCredentials) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(credentials)?;

        // Write-then-rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Saved credentials");
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<StoredCredentials>,
}

impl MemoryCredentialStore {
    pub fn new(initial: StoredCredentials) -> Self {
        MemoryCredentialStore {
            inner: Mutex::new(initial),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> SyncResult<StoredCredentials> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, credentials: &StoredCredentials) -> SyncResult<()> {
        *self.inner.lock() = credentials.clone();
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        *self.inner.lock() = StoredCredentials::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn stored() -> StoredCredentials {
        StoredCredentials {
            access_token: Some("access".into()),
            current_user: Some(
                serde_json::from_value(json!({
                    "id": "u1",
                    "email": "a@b.com",
                    "role": "client",
                    "company": "ACME"
                }))
                .unwrap(),
            ),
            refresh_token: None,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.json"));
        assert_eq!(store.load().unwrap(), StoredCredentials::default());
        assert!(store.load().unwrap().session().is_none());
    }

    #[test]
    fn test_file_store_persists_and_clears() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");
        let store = FileCredentialStore::new(&path);

        store.save(&stored()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["accessToken"], "access");
        assert_eq!(raw["currentUser"]["company"], "ACME");
        assert!(raw.get("refreshToken").is_none());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, stored());
        let (token, user) = loaded.session().unwrap();
        assert_eq!(token, "access");
        assert_eq!(user.id, "u1");

        store.clear().unwrap();
        assert!(!path.exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupted_file_is_storage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();

        let err = FileCredentialStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::default();
        store.save(&stored()).unwrap();
        assert!(store.load().unwrap().session().is_some());
        store.clear().unwrap();
        assert!(store.load().unwrap().session().is_none());
    }
}
