//! Persistence of finalized windows.
//!
//! [`WindowStore::store`] writes the full artifact under its
//! [`StorageKey`] and merges the window into the bucket summary under its
//! [`SummaryKey`]. Both writes overwrite, so storing the same window twice
//! leaves the same artifacts behind.

pub mod backend;
pub mod codec;
pub mod key;
pub mod summary;

use std::io;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use self::backend::{AsyncStorage, StorageBackend};
use self::codec::CodecError;
use self::key::{BucketRef, KeyError, StorageKey, SummaryKey, SCHEMA_VERSION};
use self::summary::{WindowSummary, WorkSummary};
use crate::aggregation::window::FinalizedWindow;
use crate::error::FailureKind;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid storage key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("file format version {found} is not supported (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("corrupt artifact at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("artifact at {key} belongs to {found}")]
    KeyMismatch { key: String, found: String },

    #[error("encoding artifact for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("storage backend failed at {key}: {source}")]
    Backend {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Bad keys and unsupported versions are the caller's fault; everything
    /// else is ours.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidKey(_) | Self::UnsupportedVersion { .. } => FailureKind::Client,
            Self::Corrupt { .. }
            | Self::KeyMismatch { .. }
            | Self::Encode { .. }
            | Self::Backend { .. } => FailureKind::Server,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.failure_kind().status_code()
    }

    /// Metric label for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "invalid_key",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::Corrupt { .. } => "corrupt",
            Self::KeyMismatch { .. } => "key_mismatch",
            Self::Encode { .. } => "encode",
            Self::Backend { .. } => "backend",
        }
    }

    fn decoding(key: String, source: CodecError) -> Self {
        match source {
            CodecError::UnsupportedVersion { found, supported } => {
                Self::UnsupportedVersion { found, supported }
            }
            source => Self::Corrupt { key, source },
        }
    }
}

/// Window persistence on top of a blob backend.
pub struct WindowStore {
    backend: StorageBackend,
    prefix: String,
    /// Serializes summary read-modify-write cycles.
    summary_lock: Mutex<()>,
}

impl WindowStore {
    pub fn new(backend: StorageBackend, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            summary_lock: Mutex::new(()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Persist `window` and fold it into its bucket summary.
    pub async fn store(&self, window: &FinalizedWindow) -> Result<StorageKey, StoreError> {
        let key = StorageKey::for_window(&self.prefix, &window.id);
        let name = key.to_string();

        let artifact = codec::encode_window(window).map_err(|source| StoreError::Encode {
            key: name.clone(),
            source,
        })?;
        let size = artifact.len();
        self.put(&name, artifact).await?;

        let summary_key = key.summary();
        {
            let _guard = self.summary_lock.lock().await;
            let mut summary = self
                .load_summary(&summary_key)
                .await?
                .unwrap_or_else(|| WindowSummary::for_window(window));
            summary.merge(WorkSummary::from_window(window));

            let summary_name = summary_key.to_string();
            let encoded = codec::encode_summary(&summary).map_err(|source| StoreError::Encode {
                key: summary_name.clone(),
                source,
            })?;
            self.put(&summary_name, encoded).await?;
        }

        debug!(key = %name, bytes = size, "stored window");
        Ok(key)
    }

    /// Load a full window artifact. A missing artifact is `Ok(None)`.
    pub async fn load(&self, key: &StorageKey) -> Result<Option<FinalizedWindow>, StoreError> {
        check_version(key.bucket.version)?;
        let name = key.to_string();
        let Some(data) = self.get(&name).await? else {
            return Ok(None);
        };
        let window = codec::decode_window(&data)
            .map_err(|source| StoreError::decoding(name.clone(), source))?;
        let found = StorageKey::for_window(&key.bucket.prefix, &window.id);
        if &found != key {
            return Err(StoreError::KeyMismatch {
                key: name,
                found: found.to_string(),
            });
        }
        Ok(Some(window))
    }

    /// Load a bucket summary. A missing summary is `Ok(None)`.
    pub async fn load_summary(
        &self,
        key: &SummaryKey,
    ) -> Result<Option<WindowSummary>, StoreError> {
        check_version(key.bucket.version)?;
        let name = key.to_string();
        let Some(data) = self.get(&name).await? else {
            return Ok(None);
        };
        let summary = codec::decode_summary(&data)
            .map_err(|source| StoreError::decoding(name.clone(), source))?;
        let found = BucketRef {
            prefix: key.bucket.prefix.clone(),
            version: SCHEMA_VERSION,
            group: summary.group.clone(),
            start: summary.start,
            duration_secs: summary.duration_secs,
        };
        if found != key.bucket {
            return Err(StoreError::KeyMismatch {
                key: name,
                found: SummaryKey { bucket: found }.to_string(),
            });
        }
        Ok(Some(summary))
    }

    /// Load a window given its rendered key.
    pub async fn load_by_name(&self, name: &str) -> Result<Option<FinalizedWindow>, StoreError> {
        let key = StorageKey::parse(name)?;
        self.load(&key).await
    }

    /// Load a summary given its rendered key.
    pub async fn load_summary_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WindowSummary>, StoreError> {
        let key = SummaryKey::parse(name)?;
        self.load_summary(&key).await
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.backend
            .put(name, data)
            .await
            .map_err(|source| StoreError::Backend {
                key: name.to_string(),
                source,
            })
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend
            .get(name)
            .await
            .map_err(|source| StoreError::Backend {
                key: name.to_string(),
                source,
            })
    }
}

fn check_version(found: u32) -> Result<(), StoreError> {
    if found == SCHEMA_VERSION {
        Ok(())
    } else {
        Err(StoreError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::backend::{FsStorage, InMemoryStorage};
    use super::*;
    use crate::aggregation::window::{
        AggregationWindow, ChunkContribution, Contributor, ProcessGroup, WindowId, WorkType,
    };
    use crate::ingest::wire::StackSample;

    fn window(work_type: WorkType) -> FinalizedWindow {
        let group = ProcessGroup::new("app1", "cluster1", "proc1");
        let mut window = AggregationWindow::new(WindowId {
            group: group.clone(),
            start: Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap(),
            duration_secs: 1800,
            work_type,
        });
        window.accept(
            &Contributor {
                group,
                work_id: 1,
                recorder_host: "h".into(),
            },
            &ChunkContribution {
                stack_samples: vec![StackSample {
                    trace_ctx: "t".into(),
                    frames: vec!["main".into()],
                }],
                io_traces: Vec::new(),
            },
        );
        window.finalize()
    }

    fn memory_store() -> WindowStore {
        WindowStore::new(StorageBackend::Memory(InMemoryStorage::new()), "profiles")
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let store = memory_store();
        let cpu = window(WorkType::CpuSample);
        let key = store.store(&cpu).await.unwrap();

        assert_eq!(store.load(&key).await.unwrap(), Some(cpu.clone()));

        let summary = store.load_summary(&key.summary()).await.unwrap().unwrap();
        assert_eq!(summary.group, cpu.id.group);
        assert_eq!(summary.works.len(), 1);
        assert_eq!(summary.works[0].sample_count, 1);
        assert_eq!(summary.works[0].trace_ctxs, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_summary_accumulates_work_types_and_is_idempotent() {
        let store = memory_store();
        let key = store.store(&window(WorkType::CpuSample)).await.unwrap();
        store.store(&window(WorkType::IoTrace)).await.unwrap();
        store.store(&window(WorkType::CpuSample)).await.unwrap();

        let summary = store.load_summary(&key.summary()).await.unwrap().unwrap();
        assert_eq!(summary.works.len(), 2);
        assert_eq!(summary.works[0].work_type, WorkType::CpuSample);
        assert_eq!(summary.works[1].work_type, WorkType::IoTrace);

        let StorageBackend::Memory(mem) = store.backend() else {
            panic!("expected memory backend");
        };
        assert_eq!(mem.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let store = memory_store();
        let key = StorageKey::for_window("profiles", &window(WorkType::IoTrace).id);
        assert_eq!(store.load(&key).await.unwrap(), None);
        assert_eq!(store.load_summary(&key.summary()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsupported_version_is_client_failure() {
        let store = memory_store();
        let mut key = StorageKey::for_window("profiles", &window(WorkType::CpuSample).id);
        key.bucket.version = SCHEMA_VERSION + 1;

        let err = store.load(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { .. }));
        assert_eq!(err.status_code(), 400);

        let err = store.load_by_name("not/a/key").await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Client);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_server_failure() {
        let backend = InMemoryStorage::new();
        let cpu = window(WorkType::CpuSample);
        let key = StorageKey::for_window("profiles", &cpu.id);
        backend.put(&key.to_string(), b"garbage".to_vec()).await.unwrap();

        let store = WindowStore::new(StorageBackend::Memory(backend), "profiles");
        let err = store.load(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_empty_identity_fields_do_not_collide_on_fs() {
        let dir = tempfile::tempdir().unwrap();
        let store = WindowStore::new(StorageBackend::Fs(FsStorage::new(dir.path())), "profiles");

        let mut a = window(WorkType::CpuSample);
        a.id.group = ProcessGroup::new("", "x", "proc1");
        let mut b = window(WorkType::CpuSample);
        b.id.group = ProcessGroup::new("x", "", "proc1");

        let ka = store.store(&a).await.unwrap();
        let kb = store.store(&b).await.unwrap();

        assert_eq!(store.load(&ka).await.unwrap(), Some(a));
        assert_eq!(store.load(&kb).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_artifact_under_wrong_key_is_rejected() {
        let backend = InMemoryStorage::new();
        let cpu = window(WorkType::CpuSample);
        let mut other = cpu.clone();
        other.id.group = ProcessGroup::new("app2", "cluster1", "proc1");

        let key = StorageKey::for_window("profiles", &cpu.id);
        backend
            .put(&key.to_string(), codec::encode_window(&other).unwrap())
            .await
            .unwrap();
        backend
            .put(
                &key.summary().to_string(),
                codec::encode_summary(&WindowSummary::for_window(&other)).unwrap(),
            )
            .await
            .unwrap();

        let store = WindowStore::new(StorageBackend::Memory(backend), "profiles");
        let err = store.load(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyMismatch { .. }));
        assert_eq!(err.failure_kind(), FailureKind::Server);
        assert!(matches!(
            store.load_summary(&key.summary()).await,
            Err(StoreError::KeyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WindowStore::new(StorageBackend::Fs(FsStorage::new(dir.path())), "profiles");
        let cpu = window(WorkType::CpuSample);
        let key = store.store(&cpu).await.unwrap();

        let loaded = store.load_by_name(&key.to_string()).await.unwrap();
        assert_eq!(loaded, Some(cpu));
        assert!(store
            .load_summary_by_name(&key.summary().to_string())
            .await
            .unwrap()
            .is_some());
    }
}
