//! Open windows, keyed by process group and time bucket.
//!
//! Each bucket holds one window per [`WorkType`] behind a single mutex, so a
//! chunk lands in all of them atomically. Buckets are removed from the map
//! before they are closed; a writer that finds a closed bucket retries in the
//! following bucket.
//!
//! Each group also keeps the start of the last bucket it closed. A span at or
//! before that mark is never opened again, so a late chunk cannot produce a
//! second window with an id that was already finalized.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::window::{
    AggregationWindow, ChunkContribution, Contributor, ContributorState, FinalizedWindow,
    ProcessGroup, WindowId, WorkType,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    group: ProcessGroup,
    start_secs: i64,
}

struct Bucket {
    closed: bool,
    windows: Vec<AggregationWindow>,
}

impl Bucket {
    fn new(group: &ProcessGroup, start: DateTime<Utc>, duration_secs: u32) -> Self {
        let windows = WorkType::ALL
            .into_iter()
            .map(|work_type| {
                AggregationWindow::new(WindowId {
                    group: group.clone(),
                    start,
                    duration_secs,
                    work_type,
                })
            })
            .collect();
        Self {
            closed: false,
            windows,
        }
    }

    fn close(&mut self) -> Vec<AggregationWindow> {
        self.closed = true;
        std::mem::take(&mut self.windows)
    }
}

/// Registry of all open aggregation windows.
pub struct WindowRegistry {
    duration_secs: u32,
    buckets: DashMap<BucketKey, Arc<Mutex<Bucket>>>,
    closed_through: DashMap<ProcessGroup, i64>,
}

impl WindowRegistry {
    /// Creates a registry with buckets of `window_duration`, rounded down to
    /// whole seconds (minimum one second).
    pub fn new(window_duration: Duration) -> Self {
        let duration_secs = u32::try_from(window_duration.as_secs())
            .unwrap_or(u32::MAX)
            .max(1);
        Self {
            duration_secs,
            buckets: DashMap::new(),
            closed_through: DashMap::new(),
        }
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    /// Start of the bucket containing `now`, aligned to the epoch.
    pub fn bucket_start(&self, now: DateTime<Utc>) -> i64 {
        let width = i64::from(self.duration_secs);
        now.timestamp().div_euclid(width) * width
    }

    /// Number of open buckets.
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of open windows across all buckets.
    pub fn open_windows(&self) -> usize {
        self.buckets
            .iter()
            .map(|entry| entry.value().lock().windows.len())
            .sum()
    }

    /// Apply a decoded chunk to the windows of the bucket open at `now`.
    /// Returns the start of the bucket that took the chunk, which is later
    /// than `now`'s bucket when that span has already been closed.
    pub fn accept(
        &self,
        contributor: &Contributor,
        chunk: &ChunkContribution,
        now: DateTime<Utc>,
    ) -> i64 {
        let width = i64::from(self.duration_secs);
        let mut start_secs = self.bucket_start(now);
        loop {
            if let Some(bucket) = self.open_bucket(&contributor.group, start_secs) {
                let mut guard = bucket.lock();
                if !guard.closed {
                    for window in &mut guard.windows {
                        window.accept(contributor, chunk);
                    }
                    return start_secs;
                }
            }
            let floor = self
                .closed_through(&contributor.group)
                .map_or(start_secs, |mark| mark.max(start_secs));
            start_secs = floor + width;
        }
    }

    /// Mark a contributor as finished in every open bucket of its group.
    pub fn mark_completed(&self, group: &ProcessGroup, work_id: u64) {
        self.settle(group, work_id, ContributorState::Completed);
    }

    /// Mark a contributor as failed in every open bucket of its group.
    /// Data already accepted from it is kept.
    pub fn mark_aborted(&self, group: &ProcessGroup, work_id: u64) {
        self.settle(group, work_id, ContributorState::Aborted);
    }

    fn settle(&self, group: &ProcessGroup, work_id: u64, state: ContributorState) {
        for bucket in self.group_buckets(group) {
            let mut guard = bucket.lock();
            for window in &mut guard.windows {
                window.settle_contributor(work_id, state);
            }
        }
    }

    /// Close and finalize every bucket whose span ended at or before `now`.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<FinalizedWindow> {
        let width = i64::from(self.duration_secs);
        let now_secs = now.timestamp();
        let mut due: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| entry.key().start_secs + width <= now_secs)
            .map(|entry| entry.key().clone())
            .collect();
        due.sort_by_key(|key| key.start_secs);
        self.close_and_finalize(due)
    }

    /// Close and finalize every open bucket regardless of its span.
    pub fn finalize_all(&self) -> Vec<FinalizedWindow> {
        let mut keys: Vec<BucketKey> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort_by_key(|key| key.start_secs);
        self.close_and_finalize(keys)
    }

    /// Discard all open windows of `group` without finalizing them.
    /// Returns the number of windows dropped.
    pub fn abandon(&self, group: &ProcessGroup) -> usize {
        let keys: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|entry| &entry.key().group == group)
            .map(|entry| entry.key().clone())
            .collect();

        let mut dropped = 0;
        for key in keys {
            if let Some((_, bucket)) = self.buckets.remove(&key) {
                dropped += bucket.lock().close().len();
            }
        }
        if dropped > 0 {
            debug!(group = %group, windows = dropped, "abandoned open windows");
        }
        dropped
    }

    fn close_and_finalize(&self, keys: Vec<BucketKey>) -> Vec<FinalizedWindow> {
        let mut finalized = Vec::new();
        for key in keys {
            // Raise the mark before the bucket leaves the map so a writer that
            // finds the slot empty also sees the mark.
            self.closed_through
                .entry(key.group.clone())
                .and_modify(|mark| *mark = (*mark).max(key.start_secs))
                .or_insert(key.start_secs);
            let Some((_, bucket)) = self.buckets.remove(&key) else {
                continue;
            };
            let windows = bucket.lock().close();
            finalized.extend(windows.into_iter().map(AggregationWindow::finalize));
        }
        finalized
    }

    fn closed_through(&self, group: &ProcessGroup) -> Option<i64> {
        self.closed_through.get(group).map(|mark| *mark)
    }

    /// The bucket at `start_secs`, created if absent. Returns `None` when the
    /// span was already closed for `group`.
    fn open_bucket(&self, group: &ProcessGroup, start_secs: i64) -> Option<Arc<Mutex<Bucket>>> {
        let key = BucketKey {
            group: group.clone(),
            start_secs,
        };
        match self.buckets.entry(key) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                if self
                    .closed_through(group)
                    .is_some_and(|mark| start_secs <= mark)
                {
                    return None;
                }
                let start = Utc
                    .timestamp_opt(start_secs, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                let bucket = Arc::new(Mutex::new(Bucket::new(
                    group,
                    start,
                    self.duration_secs,
                )));
                entry.insert(Arc::clone(&bucket));
                Some(bucket)
            }
        }
    }

    fn group_buckets(&self, group: &ProcessGroup) -> Vec<Arc<Mutex<Bucket>>> {
        self.buckets
            .iter()
            .filter(|entry| &entry.key().group == group)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::ingest::wire::StackSample;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn contributor(work_id: u64) -> Contributor {
        Contributor {
            group: ProcessGroup::new("app1", "cluster1", "proc1"),
            work_id,
            recorder_host: "host".into(),
        }
    }

    fn one_sample() -> ChunkContribution {
        ChunkContribution {
            stack_samples: vec![StackSample {
                trace_ctx: "ctx".into(),
                frames: vec!["main".into()],
            }],
            io_traces: Vec::new(),
        }
    }

    #[test]
    fn test_bucket_alignment() {
        let registry = WindowRegistry::new(Duration::from_secs(1800));
        assert_eq!(registry.bucket_start(at(1800 * 10 + 5)), 1800 * 10);
        assert_eq!(registry.bucket_start(at(1800 * 10)), 1800 * 10);
    }

    #[test]
    fn test_expire_due_only_finalizes_elapsed_buckets() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        registry.accept(&contributor(1), &one_sample(), at(10));
        registry.accept(&contributor(1), &one_sample(), at(70));
        assert_eq!(registry.open_buckets(), 2);

        assert!(registry.expire_due(at(59)).is_empty());

        let finalized = registry.expire_due(at(60));
        assert_eq!(finalized.len(), WorkType::ALL.len());
        assert!(finalized.iter().all(|w| w.id.start == at(0)));
        assert_eq!(registry.open_buckets(), 1);
    }

    #[test]
    fn test_late_chunk_skips_finalized_span() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        assert_eq!(registry.accept(&contributor(1), &one_sample(), at(10)), 0);

        let first = registry.expire_due(at(60));
        assert_eq!(first.len(), WorkType::ALL.len());
        assert!(first.iter().all(|w| w.id.start == at(0)));

        // The clock reading still falls in the finalized span.
        assert_eq!(registry.accept(&contributor(1), &one_sample(), at(59)), 60);

        let second = registry.expire_due(at(120));
        assert_eq!(second.len(), WorkType::ALL.len());
        assert!(second.iter().all(|w| w.id.start == at(60)));
        assert!(second
            .iter()
            .filter(|w| w.id.work_type == WorkType::CpuSample)
            .all(|w| w.sample_count() == 1));
    }

    #[test]
    fn test_abandoned_span_can_reopen() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        registry.accept(&contributor(1), &one_sample(), at(10));
        registry.abandon(&contributor(1).group);
        assert_eq!(registry.accept(&contributor(1), &one_sample(), at(20)), 0);
    }

    #[test]
    fn test_open_windows_counts_every_work_type() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        assert_eq!(registry.open_windows(), 0);
        registry.accept(&contributor(1), &one_sample(), at(10));
        assert_eq!(registry.open_buckets(), 1);
        assert_eq!(registry.open_windows(), WorkType::ALL.len());
        registry.accept(&contributor(1), &one_sample(), at(70));
        assert_eq!(registry.open_windows(), 2 * WorkType::ALL.len());
    }

    #[test]
    fn test_contributors_share_a_window() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        registry.accept(&contributor(1), &one_sample(), at(1));
        registry.accept(&contributor(2), &one_sample(), at(2));
        registry.mark_completed(&contributor(1).group, 1);
        registry.mark_aborted(&contributor(2).group, 2);

        let finalized = registry.finalize_all();
        let cpu = finalized
            .iter()
            .find(|w| w.id.work_type == WorkType::CpuSample)
            .unwrap();
        assert_eq!(cpu.sample_count(), 2);
        assert_eq!(cpu.contributors.len(), 2);
        assert_eq!(cpu.contributors[0].state, ContributorState::Completed);
        assert_eq!(cpu.contributors[1].state, ContributorState::Aborted);
    }

    #[test]
    fn test_abandon_discards_group() {
        let registry = WindowRegistry::new(Duration::from_secs(60));
        registry.accept(&contributor(1), &one_sample(), at(1));
        let other = Contributor {
            group: ProcessGroup::new("app2", "cluster1", "proc1"),
            work_id: 9,
            recorder_host: "h".into(),
        };
        registry.accept(&other, &one_sample(), at(1));

        assert_eq!(registry.abandon(&contributor(1).group), WorkType::ALL.len());
        assert_eq!(registry.open_buckets(), 1);
        assert_eq!(registry.abandon(&contributor(1).group), 0);
    }

    #[test]
    fn test_concurrent_accepts_are_all_counted() {
        let registry = Arc::new(WindowRegistry::new(Duration::from_secs(3600)));
        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.accept(&contributor(worker), &one_sample(), at(5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let finalized = registry.finalize_all();
        let cpu = finalized
            .iter()
            .find(|w| w.id.work_type == WorkType::CpuSample)
            .unwrap();
        assert_eq!(cpu.sample_count(), 800);
        assert_eq!(cpu.contributors.len(), 8);
    }
}
