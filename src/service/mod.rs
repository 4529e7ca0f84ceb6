use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregation::registry::WindowRegistry;
use crate::aggregation::window::ProcessGroup;
use crate::aggregation::{Aggregator, StoreRetry};
use crate::config::{Config, StorageBackendKind, StorageConfig};
use crate::export::health::HealthMetrics;
use crate::ingest::server::{ConnectionLimits, IngestServer};
use crate::leader::LeadershipState;
use crate::storage::backend::{FsStorage, InMemoryStorage, StorageBackend};
use crate::storage::WindowStore;

/// Wires ingest, aggregation, storage and health together.
pub struct Service {
    cfg: Config,
    health: Arc<HealthMetrics>,
    registry: Arc<WindowRegistry>,
    leadership: Arc<LeadershipState>,
    aggregator: Option<Aggregator>,
    ingest_task: Option<JoinHandle<()>>,
    ingest_addr: Option<SocketAddr>,
    ingest_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl Service {
    /// Creates a new Service, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let registry = Arc::new(WindowRegistry::new(cfg.aggregation.window_duration));
        let leadership = Arc::new(LeadershipState::new(Arc::clone(&health)));
        let cancel = CancellationToken::new();

        Ok(Self {
            cfg,
            health,
            registry,
            leadership,
            aggregator: None,
            ingest_task: None,
            ingest_addr: None,
            ingest_cancel: cancel.child_token(),
            cancel,
        })
    }

    /// Start all components and begin accepting agent streams.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so /healthz answers during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Storage and the rotation loop.
        let backend = create_storage(&self.cfg.storage)?;
        let store = Arc::new(WindowStore::new(backend, self.cfg.storage.prefix.clone()));
        let aggregator = Aggregator::new(
            Arc::clone(&self.registry),
            store,
            Arc::clone(&self.health),
            self.cfg.aggregation.rotation_check_interval,
        )
        .with_store_retry(StoreRetry {
            attempts: self.cfg.storage.retry_attempts,
            backoff: self.cfg.storage.retry_backoff,
        });
        aggregator.start(self.cancel.child_token()).await;
        self.aggregator = Some(aggregator);

        // 2. Ingest listener.
        let server = IngestServer::bind(
            &self.cfg.ingest.listen_addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.health),
            ConnectionLimits {
                max_message_size: self.cfg.ingest.max_message_size,
                read_buffer_size: self.cfg.ingest.read_buffer_size,
            },
        )
        .await
        .context("starting ingest server")?;
        self.ingest_addr = Some(server.local_addr()?);
        self.ingest_task = Some(tokio::spawn(server.run(self.ingest_cancel.clone())));

        info!(
            ingest_addr = ?self.ingest_addr,
            window = ?self.cfg.aggregation.window_duration,
            "service fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Connections are closed first so their contributors are settled
    /// before the remaining windows are force-finalized and flushed.
    pub async fn stop(&mut self) -> Result<()> {
        self.ingest_cancel.cancel();
        if let Some(task) = self.ingest_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "ingest task join failed");
            }
        }

        self.cancel.cancel();
        if let Some(aggregator) = &self.aggregator {
            aggregator.wait_for_shutdown().await;
        }

        if let Err(e) = self.health.stop().await {
            error!(error = %e, "error stopping health metrics server");
        }

        Ok(())
    }

    /// Address the ingest listener is bound to, once started.
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest_addr
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Handle for the external leader-election mechanism.
    pub fn leadership(&self) -> Arc<LeadershipState> {
        Arc::clone(&self.leadership)
    }

    /// Discard the open windows of `group`.
    pub fn abandon(&self, group: &ProcessGroup) -> usize {
        match &self.aggregator {
            Some(aggregator) => aggregator.abandon(group),
            None => self.registry.abandon(group),
        }
    }
}

/// Build the configured blob backend.
fn create_storage(cfg: &StorageConfig) -> Result<StorageBackend> {
    let backend = match cfg.backend {
        StorageBackendKind::Memory => StorageBackend::Memory(InMemoryStorage::new()),
        StorageBackendKind::Fs => {
            let root = cfg
                .root_dir
                .clone()
                .context("storage.root_dir is required for the fs backend")?;
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating storage root {}", root.display()))?;
            StorageBackend::Fs(FsStorage::new(root))
        }
    };
    info!(backend = backend.name(), prefix = %cfg.prefix, "storage backend ready");
    Ok(backend)
}
