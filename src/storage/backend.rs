//! Blob storage backends.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

/// Async key/value blob store. Writes overwrite; a missing key reads as
/// `None`.
pub trait AsyncStorage: Send + Sync {
    fn put(&self, key: &str, data: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;
}

/// Process-local store, used in tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

impl AsyncStorage for InMemoryStorage {
    async fn put(&self, key: &str, data: Vec<u8>) -> io::Result<()> {
        self.blobs.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }
}

/// Stores each key as a file under `root`, with `/` mapping to directories.
/// Writes go to a temporary sibling first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("storage key {key:?} is not a plain relative path"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl AsyncStorage for FsStorage {
    async fn put(&self, key: &str, data: Vec<u8>) -> io::Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Configured backend.
///
/// Enum dispatch keeps the store free of boxed futures.
#[derive(Debug)]
pub enum StorageBackend {
    Memory(InMemoryStorage),
    Fs(FsStorage),
}

impl StorageBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Fs(_) => "fs",
        }
    }
}

impl AsyncStorage for StorageBackend {
    async fn put(&self, key: &str, data: Vec<u8>) -> io::Result<()> {
        match self {
            Self::Memory(s) => s.put(key, data).await,
            Self::Fs(s) => s.put(key, data).await,
        }
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(s) => s.get(key).await,
            Self::Fs(s) => s.get(key).await,
        }
    }
}
