//! Credential storage with platform keyring and file-based fallback.
//!
//! The store is a generic key-value namespace. The sign-in flow owns exactly
//! two keys in it, [`TOKEN_KEY`] and [`LOGIN_KEY`], and a session only exists
//! when both are present.
//!
//! Storage priority:
//! 1. Platform keyring (if `keyring-storage` feature enabled and available)
//! 2. File-based storage (JSON map, owner-only permissions on Unix)

use crate::auth::error::AuthError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(feature = "keyring-storage")]
use keyring::Entry;

/// Key holding the session token issued by the identity gateway.
pub const TOKEN_KEY: &str = "@token";
/// Key holding the account login returned by the provider.
pub const LOGIN_KEY: &str = "@login";

/// Service name used for keyring storage
#[cfg(feature = "keyring-storage")]
const KEYRING_SERVICE: &str = "hubnotify";

const CREDENTIALS_FILE: &str = "credentials.json";

/// Key-value persistence for credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// Removing a key that is not present succeeds.
    async fn remove(&self, key: &str) -> Result<(), AuthError>;
}

/// The persisted result of a successful sign-in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub session_token: String,
    pub account_login: String,
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("session_token", &"<redacted>")
            .field("account_login", &self.account_login)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub account_login: Option<String>,
}

/// Get the hubnotify config directory
pub(crate) fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Failed to find config directory")?;
    Ok(config_dir.join("hubnotify"))
}

// ============================================================================
// Session helpers
// ============================================================================

/// Read the session from the store.
///
/// Returns `Some` only when both keys are present. A lone token or a lone
/// login is an interrupted write and never counts as a session.
pub async fn load_session(
    store: &dyn CredentialStore,
) -> Result<Option<SessionCredentials>, AuthError> {
    let token = store.get(TOKEN_KEY).await?;
    let login = store.get(LOGIN_KEY).await?;

    match (token, login) {
        (Some(session_token), Some(account_login)) => Ok(Some(SessionCredentials {
            session_token,
            account_login,
        })),
        (None, None) => Ok(None),
        (token, _) => {
            tracing::warn!(
                "Incomplete credential pair in store (token present: {}), treating as signed out",
                token.is_some()
            );
            Ok(None)
        }
    }
}

/// Persist both credential fields, token first.
pub async fn save_session(
    store: &dyn CredentialStore,
    creds: &SessionCredentials,
) -> Result<(), AuthError> {
    store.set(TOKEN_KEY, &creds.session_token).await?;
    store.set(LOGIN_KEY, &creds.account_login).await?;
    tracing::info!("Session saved for account: {}", creds.account_login);
    Ok(())
}

/// Remove both credential keys.
///
/// The second removal is attempted even when the first fails; the first
/// error encountered is returned.
pub async fn clear_session(store: &dyn CredentialStore) -> Result<(), AuthError> {
    let token = store.remove(TOKEN_KEY).await;
    let login = store.remove(LOGIN_KEY).await;
    token.and(login)
}

/// Report whether a complete session is stored.
pub async fn auth_status(store: &dyn CredentialStore) -> Result<AuthStatus, AuthError> {
    Ok(match load_session(store).await? {
        Some(creds) => AuthStatus {
            authenticated: true,
            account_login: Some(creds.account_login),
        },
        None => AuthStatus {
            authenticated: false,
            account_login: None,
        },
    })
}

// ============================================================================
// File-based credential storage (always available)
// ============================================================================

/// JSON map of key to value in a single file.
///
/// Each `set`/`remove` rewrites the file through a temporary sibling and a
/// rename, so a crash leaves either the old map or the new one.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store under `~/.config/hubnotify/credentials.json` (platform equivalent).
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(get_config_dir()?.join(CREDENTIALS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, AuthError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AuthError::Storage(format!("Failed to read credentials file: {e}")))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| AuthError::Storage(format!("Failed to parse credentials file: {e}")))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> Result<(), AuthError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                AuthError::Storage(format!("Failed to create credentials directory: {e}"))
            })?;
        }

        let json = serde_json::to_string_pretty(map)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize credentials: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");

        // Set restrictive permissions on Unix before writing
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600) // Owner read/write only
                .open(&tmp_path)
                .map_err(|e| AuthError::Storage(format!("Failed to create credentials file: {e}")))?;
            file.write_all(json.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(|e| AuthError::Storage(format!("Failed to write credentials: {e}")))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&tmp_path, &json)
                .map_err(|e| AuthError::Storage(format!("Failed to write credentials: {e}")))?;
        }

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| AuthError::Storage(format!("Failed to replace credentials file: {e}")))?;
        tracing::debug!("Credentials written to file: {:?}", self.path);
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let _guard = self.guard();
        Ok(self.read_map()?.remove(key))
    }

    async fn remove(&self, key: &str) -> Result<(), AuthError> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        if map.remove(key).is_none() {
            return Ok(());
        }
        self.write_map(&map)
    }
}

// ============================================================================
// Keyring-based credential storage (optional, platform-specific)
// ============================================================================

/// One keyring entry per key, with the file store as fallback.
#[cfg(feature = "keyring-storage")]
#[derive(Debug)]
pub struct KeyringCredentialStore {
    service: String,
    fallback: FileCredentialStore,
}

#[cfg(feature = "keyring-storage")]
impl KeyringCredentialStore {
    pub fn new(fallback: FileCredentialStore) -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            fallback,
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, AuthError> {
        tracing::trace!(
            "Creating keyring entry for service='{}', user='{}'",
            self.service,
            key
        );
        Entry::new(&self.service, key).map_err(|e| {
            tracing::error!(
                "Failed to create keyring entry (service='{}', user='{}'): {}",
                self.service,
                key,
                e
            );
            AuthError::Storage(format!("Failed to create keyring entry: {e}"))
        })
    }
}

#[cfg(feature = "keyring-storage")]
#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let entry = match self.entry(key) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("{}, using file storage", e);
                return self.fallback.set(key, value).await;
            }
        };

        if let Err(e) = entry.set_password(value) {
            tracing::warn!("Failed to save {} to keyring: {}, using file storage", key, e);
            return self.fallback.set(key, value).await;
        }

        // Verify the save worked
        match entry.get_password() {
            Ok(stored) if stored == value => {
                tracing::debug!("{} verified in keyring after save", key);
                Ok(())
            }
            Ok(_) => {
                tracing::warn!("{} mismatch after save, using file storage", key);
                self.fallback.set(key, value).await
            }
            Err(keyring::Error::NoEntry) => {
                tracing::warn!("{} not found after save, falling back to file storage", key);
                self.fallback.set(key, value).await
            }
            Err(e) => {
                tracing::warn!("Could not verify {} after save: {}", key, e);
                Ok(())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let entry = match self.entry(key) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("{}, trying file fallback", e);
                return self.fallback.get(key).await;
            }
        };

        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => self.fallback.get(key).await,
            Err(e) => {
                tracing::warn!(
                    "Failed to load {} from keyring: {}, trying file fallback",
                    key,
                    e
                );
                self.fallback.get(key).await
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<(), AuthError> {
        // Always delete from file as well
        let file_result = self.fallback.remove(key).await;

        let entry = self.entry(key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => file_result,
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to delete {key} from keyring: {e}"
            ))),
        }
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), AuthError> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Open the default credential store for this build.
///
/// Uses keyring storage if available, falling back to file storage. The
/// `file-storage` feature forces the file store even when the keyring is
/// compiled in.
pub fn default_store() -> Result<Box<dyn CredentialStore>> {
    let file = FileCredentialStore::default_location()?;

    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage")))]
    let store: Box<dyn CredentialStore> = Box::new(KeyringCredentialStore::new(file));

    #[cfg(any(not(feature = "keyring-storage"), feature = "file-storage"))]
    let store: Box<dyn CredentialStore> = Box::new(file);

    Ok(store)
}

/// Get information about credential storage location (for documentation/debugging)
pub fn get_credential_storage_info() -> String {
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage"), target_os = "windows"))]
    {
        "Windows Credential Manager (with file fallback)".to_string()
    }
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage"), target_os = "macos"))]
    {
        "macOS Keychain (with file fallback)".to_string()
    }
    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage"), target_os = "linux"))]
    {
        "Linux Secret Service (GNOME Keyring/KWallet, with file fallback)".to_string()
    }
    #[cfg(all(
        feature = "keyring-storage",
        not(feature = "file-storage"),
        not(any(target_os = "windows", target_os = "macos", target_os = "linux"))
    ))]
    {
        "Platform keyring (with file fallback)".to_string()
    }
    #[cfg(any(not(feature = "keyring-storage"), feature = "file-storage"))]
    {
        let path = get_config_dir()
            .map(|p| p.join(CREDENTIALS_FILE).display().to_string())
            .unwrap_or_else(|_| "~/.config/hubnotify/credentials.json".to_string());
        format!("File-based storage: {}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> FileCredentialStore {
        FileCredentialStore::new(dir.path().join("nested").join(CREDENTIALS_FILE))
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.set(TOKEN_KEY, "tok_1").await.unwrap();
        store.set(LOGIN_KEY, "octocat").await.unwrap();

        let reopened = file_store(&dir);
        assert_eq!(reopened.get(TOKEN_KEY).await.unwrap().as_deref(), Some("tok_1"));
        assert_eq!(reopened.get(LOGIN_KEY).await.unwrap().as_deref(), Some("octocat"));
        assert!(!reopened.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_keeps_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.set("@theme", "dark").await.unwrap();
        store.set(TOKEN_KEY, "tok_1").await.unwrap();
        store.set(LOGIN_KEY, "octocat").await.unwrap();

        clear_session(&store).await.unwrap();

        assert_eq!(store.get("@theme").await.unwrap().as_deref(), Some("dark"));
        assert_eq!(store.get(TOKEN_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_remove_missing_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.remove(TOKEN_KEY).await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        let err = store.get(TOKEN_KEY).await.unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        store.set(TOKEN_KEY, "tok_1").await.unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_partial_pair_is_not_a_session() {
        let store = MemoryCredentialStore::new();
        store.set(TOKEN_KEY, "tok_1").await.unwrap();
        assert_eq!(load_session(&store).await.unwrap(), None);
        assert!(!auth_status(&store).await.unwrap().authenticated);

        store.remove(TOKEN_KEY).await.unwrap();
        store.set(LOGIN_KEY, "octocat").await.unwrap();
        assert_eq!(load_session(&store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load_session() {
        let store = MemoryCredentialStore::new();
        let creds = SessionCredentials {
            session_token: "tok_1".into(),
            account_login: "octocat".into(),
        };
        save_session(&store, &creds).await.unwrap();

        assert_eq!(load_session(&store).await.unwrap(), Some(creds));
        let status = auth_status(&store).await.unwrap();
        assert!(status.authenticated);
        assert_eq!(status.account_login.as_deref(), Some("octocat"));
    }

    #[cfg(any(not(feature = "keyring-storage"), feature = "file-storage"))]
    #[test]
    fn test_file_only_build_reports_file_storage() {
        let info = get_credential_storage_info();
        assert!(info.starts_with("File-based storage"), "{info}");
        assert!(info.ends_with(CREDENTIALS_FILE));
    }

    #[cfg(all(feature = "keyring-storage", not(feature = "file-storage")))]
    #[test]
    fn test_keyring_build_reports_fallback() {
        assert!(get_credential_storage_info().contains("with file fallback"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = SessionCredentials {
            session_token: "tok_secret".into(),
            account_login: "octocat".into(),
        };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("tok_secret"));
        assert!(printed.contains("octocat"));
    }
}
