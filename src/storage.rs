use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::AuthlyError;

/// Storage key for the CSRF state persisted across the redirect boundary.
pub const STATE_KEY: &str = "authly.pkce_state";
/// Storage key for the PKCE verifier persisted across the redirect boundary.
pub const VERIFIER_KEY: &str = "authly.pkce_verifier";
/// Storage key for the cached session token.
pub const TOKEN_KEY: &str = "authly.access_token";

/// Key/value storage capability used by the session engine.
///
/// Implementations may be backed by anything with get/set/remove semantics
/// (browser storage bridges, files, databases). The engine never assumes
/// exclusive access: the same store may be shared across processes or tabs.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AuthlyError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), AuthlyError>;
    async fn remove_item(&self, key: &str) -> Result<(), AuthlyError>;
}

/// In-memory storage, for tests and single-process embedders.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AuthlyError> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), AuthlyError> {
        self.items
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), AuthlyError> {
        self.items.lock().await.remove(key);
        Ok(())
    }
}

/// File-backed storage: a flat JSON map in a single file.
///
/// Defaults to `~/.authly/storage.json`. Reads and writes go through a lock
/// so concurrent engine calls within one process cannot interleave a
/// read-modify-write; cross-process sharing is last-write-wins.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Storage file under the user's home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".authly")
            .join("storage.json")
    }

    fn read_map(&self) -> Result<HashMap<String, String>, AuthlyError> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| AuthlyError::Storage(format!("corrupt storage file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(AuthlyError::Io(e)),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<(), AuthlyError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(map)
            .map_err(|e| AuthlyError::Storage(format!("failed to serialize storage: {e}")))?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AuthlyError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_map()?.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), AuthlyError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    async fn remove_item(&self, key: &str) -> Result<(), AuthlyError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}
