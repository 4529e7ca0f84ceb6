pub mod io_props;
pub mod io_source;
pub mod registry;
pub mod window;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::registry::WindowRegistry;
use self::window::{FinalizedWindow, ProcessGroup};
use crate::export::health::HealthMetrics;
use crate::storage::{StoreError, WindowStore};

/// How often a retryable storage failure is attempted before the window is
/// dropped. The delay doubles after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Drives window rotation and hands finalized windows to storage.
///
/// Two tasks run per aggregator: a rotation loop that finalizes elapsed
/// buckets on a ticker, and a storage task that persists whatever the loop
/// sends it. Storage latency never holds a bucket lock.
pub struct Aggregator {
    registry: Arc<WindowRegistry>,
    store: Arc<WindowStore>,
    health: Arc<HealthMetrics>,
    rotation_interval: Duration,
    retry: StoreRetry,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<WindowRegistry>,
        store: Arc<WindowStore>,
        health: Arc<HealthMetrics>,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            health,
            rotation_interval,
            retry: StoreRetry::default(),
            tasks: tokio::sync::Mutex::new(Vec::with_capacity(2)),
        }
    }

    /// Replace the default storage retry policy.
    pub fn with_store_retry(mut self, retry: StoreRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<WindowRegistry> {
        &self.registry
    }

    /// Spawn the rotation loop and storage task. Cancelling `ctx`
    /// force-finalizes every open bucket and flushes it before both tasks
    /// exit.
    pub async fn start(&self, ctx: CancellationToken) {
        let (window_tx, window_rx) = mpsc::unbounded_channel();

        let storage_task = tokio::spawn(run_storage(
            window_rx,
            Arc::clone(&self.store),
            Arc::clone(&self.health),
            self.retry,
        ));

        let registry = Arc::clone(&self.registry);
        let health = Arc::clone(&self.health);
        let interval = self.rotation_interval;

        let rotation_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let windows = registry.finalize_all();
                        info!(windows = windows.len(), "final flush of open windows");
                        dispatch(&window_tx, &health, windows);
                        health.windows_open.set(0.0);
                        // Dropping the sender lets the storage task drain and exit.
                        return;
                    }

                    _ = ticker.tick() => {
                        let windows = registry.expire_due(Utc::now());
                        if !windows.is_empty() {
                            debug!(windows = windows.len(), "rotating elapsed windows");
                        }
                        dispatch(&window_tx, &health, windows);
                        health.windows_open.set(registry.open_windows() as f64);
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(rotation_task);
        tasks.push(storage_task);

        info!(
            window_secs = self.registry.duration_secs(),
            rotation_interval = ?self.rotation_interval,
            backend = self.store.backend().name(),
            "aggregator started"
        );
    }

    /// Discard the open windows of `group`. Nothing is persisted for them.
    pub fn abandon(&self, group: &ProcessGroup) -> usize {
        let dropped = self.registry.abandon(group);
        self.health.windows_abandoned.inc_by(dropped as f64);
        self.health
            .windows_open
            .set(self.registry.open_windows() as f64);
        dropped
    }

    /// Waits for the rotation loop and storage task to finish.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "aggregator task join failed");
            }
        }
    }
}

fn dispatch(
    tx: &mpsc::UnboundedSender<FinalizedWindow>,
    health: &HealthMetrics,
    windows: Vec<FinalizedWindow>,
) {
    for window in windows {
        health
            .windows_finalized
            .with_label_values(&[window.id.work_type.as_str()])
            .inc();
        if tx.send(window).is_err() {
            error!("storage task gone, dropping finalized window");
        }
    }
}

async fn run_storage(
    mut rx: mpsc::UnboundedReceiver<FinalizedWindow>,
    store: Arc<WindowStore>,
    health: Arc<HealthMetrics>,
    retry: StoreRetry,
) {
    while let Some(window) = rx.recv().await {
        persist(&store, &health, retry, &window).await;
    }
    debug!("storage task drained");
}

/// Store one finalized window, recording the outcome. Empty windows are
/// skipped. Server-side failures are retried per `retry`; client-side ones
/// drop the window at once. Returns whether an artifact was written.
pub async fn persist(
    store: &WindowStore,
    health: &HealthMetrics,
    retry: StoreRetry,
    window: &FinalizedWindow,
) -> bool {
    let work_type = window.id.work_type.as_str();
    if window.is_empty() {
        health.windows_empty.inc();
        debug!(
            group = %window.id.group,
            start = %window.id.start,
            work_type,
            "skipping empty window"
        );
        return false;
    }

    let result = with_retry(retry, health, move || async move {
        let started = Instant::now();
        let result = store.store(window).await;
        health
            .store_duration
            .with_label_values(&[store.backend().name()])
            .observe(started.elapsed().as_secs_f64());
        result
    })
    .await;

    match result {
        Ok(key) => {
            health.windows_persisted.with_label_values(&[work_type]).inc();
            info!(
                key = %key,
                samples = window.sample_count(),
                contributors = window.contributors.len(),
                "persisted window"
            );
            true
        }
        Err(e) => {
            health
                .store_errors
                .with_label_values(&[e.as_str(), e.failure_kind().as_str()])
                .inc();
            error!(
                group = %window.id.group,
                start = %window.id.start,
                work_type,
                status = e.status_code(),
                error = %e,
                "persisting window failed"
            );
            false
        }
    }
}

/// Run `op` until it succeeds, fails with a client-side error, or runs out of
/// attempts. Each retried failure is counted in `store_errors`.
pub async fn with_retry<T, F, Fut>(
    retry: StoreRetry,
    health: &HealthMetrics,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = retry.backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.failure_kind().is_retryable() && attempt < retry.attempts => {
                health
                    .store_errors
                    .with_label_values(&[e.as_str(), e.failure_kind().as_str()])
                    .inc();
                warn!(
                    attempt,
                    retry_in = ?delay,
                    error = %e,
                    "store attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::aggregation::window::{ChunkContribution, Contributor};
    use crate::ingest::wire::StackSample;
    use crate::storage::backend::{InMemoryStorage, StorageBackend};

    fn contributor() -> Contributor {
        Contributor {
            group: ProcessGroup::new("app1", "cluster1", "proc1"),
            work_id: 9,
            recorder_host: "h".into(),
        }
    }

    fn cpu_chunk() -> ChunkContribution {
        ChunkContribution {
            stack_samples: vec![StackSample {
                trace_ctx: "ctx".into(),
                frames: vec!["main".into(), "work".into()],
            }],
            io_traces: Vec::new(),
        }
    }

    fn setup() -> (Aggregator, Arc<WindowStore>, Arc<HealthMetrics>) {
        let registry = Arc::new(WindowRegistry::new(Duration::from_secs(60)));
        let store = Arc::new(WindowStore::new(
            StorageBackend::Memory(InMemoryStorage::new()),
            "profiles",
        ));
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let aggregator = Aggregator::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&health),
            Duration::from_secs(3600),
        );
        (aggregator, store, health)
    }

    fn stored_keys(store: &WindowStore) -> Vec<String> {
        let StorageBackend::Memory(mem) = store.backend() else {
            panic!("expected memory backend");
        };
        mem.keys()
    }

    #[tokio::test]
    async fn test_cancel_flushes_open_windows() {
        let (aggregator, store, health) = setup();
        aggregator
            .registry()
            .accept(&contributor(), &cpu_chunk(), Utc::now());

        let ctx = CancellationToken::new();
        aggregator.start(ctx.child_token()).await;
        ctx.cancel();
        aggregator.wait_for_shutdown().await;

        // CPU artifact and summary; the io window is empty and skipped.
        let keys = stored_keys(&store);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.ends_with("/cpu_sample_work")));
        assert!(keys.iter().any(|k| k.ends_with("/summary")));
        assert_eq!(health.windows_empty.get(), 1.0);
        assert_eq!(aggregator.registry().open_buckets(), 0);
    }

    #[tokio::test]
    async fn test_abandon_persists_nothing() {
        let (aggregator, store, health) = setup();
        let c = contributor();
        aggregator.registry().accept(&c, &cpu_chunk(), Utc::now());
        let next = Utc::now() + chrono::Duration::seconds(60);
        aggregator.registry().accept(&c, &cpu_chunk(), next);
        assert_eq!(aggregator.registry().open_windows(), 4);
        assert_eq!(aggregator.abandon(&c.group), 4);
        assert_eq!(health.windows_abandoned.get(), 4.0);
        assert_eq!(health.windows_open.get(), 0.0);

        let ctx = CancellationToken::new();
        aggregator.start(ctx.clone()).await;
        ctx.cancel();
        aggregator.wait_for_shutdown().await;
        assert!(stored_keys(&store).is_empty());
    }

    #[tokio::test]
    async fn test_persist_skips_empty_and_stores_data() {
        let (aggregator, store, health) = setup();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
        aggregator.registry().accept(&contributor(), &cpu_chunk(), t0);

        let windows = aggregator
            .registry()
            .expire_due(t0 + chrono::Duration::seconds(60));
        assert_eq!(windows.len(), 2);

        let mut written = 0;
        for window in &windows {
            if persist(&store, &health, StoreRetry::default(), window).await {
                written += 1;
            }
        }
        assert_eq!(written, 1);
        assert_eq!(
            health
                .windows_persisted
                .with_label_values(&["cpu_sample_work"])
                .get(),
            1.0
        );
    }

    fn quick_retry() -> StoreRetry {
        StoreRetry {
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn cpu_window(aggregator: &Aggregator) -> FinalizedWindow {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
        aggregator.registry().accept(&contributor(), &cpu_chunk(), t0);
        aggregator
            .registry()
            .expire_due(t0 + chrono::Duration::seconds(60))
            .into_iter()
            .find(|w| !w.is_empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_failure_is_retried_until_stored() {
        let (aggregator, store, health) = setup();
        let window = cpu_window(&aggregator);
        let calls = AtomicU32::new(0);

        let (calls_ref, store_ref, window_ref) = (&calls, &store, &window);
        let key = with_retry(quick_retry(), &health, move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Backend {
                    key: "blob".into(),
                    source: std::io::Error::other("backend unavailable"),
                });
            }
            store_ref.store(window_ref).await
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.load(&key).await.unwrap(), Some(window));
        assert_eq!(
            health
                .store_errors
                .with_label_values(&["backend", "server"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_client_failure_is_not_retried() {
        let (_, _, health) = setup();
        let calls = AtomicU32::new(0);

        let calls_ref = &calls;
        let result: Result<(), StoreError> =
            with_retry(quick_retry(), &health, move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::UnsupportedVersion {
                    found: 9,
                    supported: 1,
                })
            })
            .await;

        assert!(matches!(result, Err(StoreError::UnsupportedVersion { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_stop_after_last_attempt() {
        let (_, _, health) = setup();
        let calls = AtomicU32::new(0);

        let calls_ref = &calls;
        let result: Result<(), StoreError> =
            with_retry(quick_retry(), &health, move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Backend {
                    key: "blob".into(),
                    source: std::io::Error::other("still down"),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
