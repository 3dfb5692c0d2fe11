//! Whole-value JSON persistence scopes.
//!
//! Both the durable scope (history, daily aggregates) and the tab scope
//! (current session) expose the same surface: get, set and remove a whole
//! serialized document under a key. There are no partial updates and no
//! cross-handle locking; a read-modify-write from two handles is last writer
//! wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AnalyticsError, Result};

/// Durable key holding the capped visitor history list.
pub const HISTORY_KEY: &str = "visitor_history";
/// Durable key holding the daily aggregate rows.
pub const DAILY_KEY: &str = "daily_aggregates";
/// Tab-scoped key holding the current session.
pub const CURRENT_SESSION_KEY: &str = "current_session";

const CHANGE_CAPACITY: usize = 256;

/// Notification that a key was written or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// Handle that made the change. `Uuid::nil()` when the writer is unknown
    /// (another process, observed through the file watcher).
    pub origin: Uuid,
}

/// Get/set/remove of whole JSON documents under named keys.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Identity of this handle, carried on the changes it makes.
    fn origin(&self) -> Uuid;

    /// Feed of changes made through any handle on the same backing data.
    fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        None
    }
}

/// In-process store. Clones and [`MemoryStore::handle`]s share the same map.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    origin: Uuid,
}

struct MemoryInner {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                entries: RwLock::new(HashMap::new()),
                changes,
            }),
            origin: Uuid::new_v4(),
        }
    }

    /// Another view of the same data with its own origin, like a second tab
    /// opened on the same site.
    pub fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: Uuid::new_v4(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, key: &str) {
        // No receivers is fine.
        let _ = self.inner.changes.send(StorageChange {
            key: key.to_string(),
            origin: self.origin,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .inner
            .entries
            .read()
            .map_err(|e| AnalyticsError::storage(key, format!("lock poisoned: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut entries = self
                .inner
                .entries
                .write()
                .map_err(|e| AnalyticsError::storage(key, format!("lock poisoned: {}", e)))?;
            entries.insert(key.to_string(), value.to_string());
        }
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut entries = self
                .inner
                .entries
                .write()
                .map_err(|e| AnalyticsError::storage(key, format!("lock poisoned: {}", e)))?;
            entries.remove(key).is_some()
        };
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    fn origin(&self) -> Uuid {
        self.origin
    }

    fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        Some(self.inner.changes.subscribe())
    }
}

/// Directory-backed store: one `<key>.json` file per key.
///
/// Writes go through a temp file and a rename, so readers in other processes
/// never observe a half-written document.
pub struct FileStore {
    dir: PathBuf,
    origin: Uuid,
    changes: broadcast::Sender<StorageChange>,
    watcher: Option<Mutex<RecommendedWatcher>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            dir,
            origin: Uuid::new_v4(),
            changes,
            watcher: None,
        })
    }

    /// Open a store and watch its directory, so writes from other processes
    /// show up on [`KeyValueStore::changes`].
    pub fn watched(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::open(dir)?;
        let tx = store.changes.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        notify::EventKind::Create(_)
                            | notify::EventKind::Modify(_)
                            | notify::EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in &event.paths {
                        if let Some(key) = key_from_path(path) {
                            let _ = tx.send(StorageChange {
                                key,
                                origin: Uuid::nil(),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!("Store watch error: {:?}", e);
                }
            }
        })
        .map_err(|e| AnalyticsError::Watch(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&store.dir, RecursiveMode::NonRecursive)
            .map_err(|e| AnalyticsError::Watch(format!("Failed to watch {:?}: {}", store.dir, e)))?;
        debug!("Watching store directory: {:?}", store.dir);

        store.watcher = Some(Mutex::new(watcher));
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_watched(&self) -> bool {
        self.watcher.is_some()
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(AnalyticsError::storage(key, "invalid key"));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    fn notify(&self, key: &str) {
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            origin: self.origin,
        });
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{}.{}.tmp", key, self.origin.simple()));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        // The watcher reports our own writes too, but only when one exists.
        if self.watcher.is_none() {
            self.notify(key);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                if self.watcher.is_none() {
                    self.notify(key);
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn origin(&self) -> Uuid {
        self.origin
    }

    fn changes(&self) -> Option<broadcast::Receiver<StorageChange>> {
        Some(self.changes.subscribe())
    }
}

fn key_from_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

/// Read and parse a document, falling back to the default value when it is
/// missing, unreadable or corrupted.
pub fn read_json<T>(store: &dyn KeyValueStore, key: &str) -> T
where
    T: DeserializeOwned + Default,
{
    read_json_opt(store, key).unwrap_or_default()
}

/// Read and parse a document. Missing, unreadable or corrupted → `None`.
pub fn read_json_opt<T>(store: &dyn KeyValueStore, key: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read '{}': {}", key, e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Discarding corrupted '{}': {}", key, e);
            None
        }
    }
}

/// Serialize and write a document. Failures are logged and the write is
/// skipped; returns whether the write landed.
pub fn write_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool
where
    T: Serialize + ?Sized,
{
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize '{}': {}", key, e);
            return false;
        }
    };
    match store.set(key, &json) {
        Ok(()) => true,
        Err(e) => {
            warn!("Skipping write of '{}': {}", key, e);
            false
        }
    }
}

/// Remove a document, logging failures.
pub fn remove_key(store: &dyn KeyValueStore, key: &str) -> bool {
    match store.remove(key) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove '{}': {}", key, e);
            false
        }
    }
}
