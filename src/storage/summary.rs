//! Per-bucket summary listing which work types were stored and who
//! contributed to them.

use chrono::{DateTime, Utc};

use crate::aggregation::window::{ContributorInfo, FinalizedWindow, ProcessGroup, WorkType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSummary {
    pub work_type: WorkType,
    pub contributors: Vec<ContributorInfo>,
    pub trace_ctxs: Vec<String>,
    pub sample_count: u64,
}

impl WorkSummary {
    pub fn from_window(window: &FinalizedWindow) -> Self {
        Self {
            work_type: window.id.work_type,
            contributors: window.contributors.clone(),
            trace_ctxs: window.trace_ctxs(),
            sample_count: window.sample_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSummary {
    pub group: ProcessGroup,
    pub start: DateTime<Utc>,
    pub duration_secs: u32,
    /// One entry per stored work type, ordered by work type.
    pub works: Vec<WorkSummary>,
}

impl WindowSummary {
    /// Empty summary for the bucket `window` belongs to.
    pub fn for_window(window: &FinalizedWindow) -> Self {
        Self {
            group: window.id.group.clone(),
            start: window.id.start,
            duration_secs: window.id.duration_secs,
            works: Vec::new(),
        }
    }

    /// Insert or replace the entry for `work.work_type`.
    pub fn merge(&mut self, work: WorkSummary) {
        match self
            .works
            .binary_search_by_key(&work.work_type, |w| w.work_type)
        {
            Ok(idx) => {
                if let Some(slot) = self.works.get_mut(idx) {
                    *slot = work;
                }
            }
            Err(idx) => self.works.insert(idx, work),
        }
    }

    pub fn work(&self, work_type: WorkType) -> Option<&WorkSummary> {
        self.works.iter().find(|w| w.work_type == work_type)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn work(work_type: WorkType, samples: u64) -> WorkSummary {
        WorkSummary {
            work_type,
            contributors: Vec::new(),
            trace_ctxs: vec!["ctx".into()],
            sample_count: samples,
        }
    }

    #[test]
    fn test_merge_replaces_same_work_type() {
        let mut summary = WindowSummary {
            group: ProcessGroup::new("a", "c", "p"),
            start: Utc.timestamp_opt(0, 0).unwrap(),
            duration_secs: 60,
            works: Vec::new(),
        };
        summary.merge(work(WorkType::IoTrace, 1));
        summary.merge(work(WorkType::CpuSample, 2));
        summary.merge(work(WorkType::IoTrace, 3));

        assert_eq!(summary.works.len(), 2);
        assert_eq!(summary.works[0].work_type, WorkType::CpuSample);
        assert_eq!(summary.work(WorkType::IoTrace).unwrap().sample_count, 3);
    }
}
