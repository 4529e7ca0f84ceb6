//! Time-bounded aggregation windows.
//!
//! A window collects one work type's samples for one process group over one
//! bucket of wall-clock time. Open windows are mutable and owned by the
//! registry; [`AggregationWindow::finalize`] consumes a window and produces an
//! immutable [`FinalizedWindow`] ready for storage.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::io_props::{IoTraceStats, IoTracingProps};
use super::io_source::{invalid_source_id, IoSource, IoSourceLookup};
use crate::ingest::wire::{FdInfo, IoTrace, IoTraceType, StackSample};

/// Kind of profiling work a window aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkType {
    CpuSample,
    IoTrace,
}

impl WorkType {
    pub const ALL: [WorkType; 2] = [WorkType::CpuSample, WorkType::IoTrace];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuSample => "cpu_sample_work",
            Self::IoTrace => "io_trace_work",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.as_str() == name)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::CpuSample => 0,
            Self::IoTrace => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::CpuSample),
            1 => Some(Self::IoTrace),
            _ => None,
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processes whose recordings aggregate together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessGroup {
    pub app_id: String,
    pub cluster_id: String,
    pub proc_name: String,
}

impl ProcessGroup {
    pub fn new(
        app_id: impl Into<String>,
        cluster_id: impl Into<String>,
        proc_name: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            cluster_id: cluster_id.into(),
            proc_name: proc_name.into(),
        }
    }
}

impl fmt::Display for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_id, self.cluster_id, self.proc_name)
    }
}

/// Full identity of a window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowId {
    pub group: ProcessGroup,
    pub start: DateTime<Utc>,
    pub duration_secs: u32,
    pub work_type: WorkType,
}

impl WindowId {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + ChronoDuration::seconds(i64::from(self.duration_secs))
    }
}

/// Availability of a single agent's recording within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributorState {
    /// Still streaming.
    Ongoing,
    /// Sent the end-of-stream marker.
    Completed,
    /// Stream failed or was cut.
    Aborted,
    /// Window closed while the stream was still open.
    Partial,
}

impl ContributorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Partial => "partial",
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ongoing => 0,
            Self::Completed => 1,
            Self::Aborted => 2,
            Self::Partial => 3,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ongoing),
            1 => Some(Self::Completed),
            2 => Some(Self::Aborted),
            3 => Some(Self::Partial),
            _ => None,
        }
    }
}

/// Identity of one recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    pub group: ProcessGroup,
    pub work_id: u64,
    pub recorder_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributorInfo {
    pub work_id: u64,
    pub recorder_host: String,
    pub state: ContributorState,
    /// Chunks received in this window's bucket.
    pub chunks: u64,
    /// Samples of this window's work type.
    pub samples: u64,
}

/// I/O trace with its descriptor resolved by the ingest session. `fd` is
/// `None` when the descriptor was never announced.
#[derive(Debug, Clone)]
pub struct ResolvedIoTrace {
    pub fd: Option<FdInfo>,
    pub trace: IoTrace,
}

/// Data from one decoded chunk, applied to every window of a bucket.
#[derive(Debug, Clone, Default)]
pub struct ChunkContribution {
    pub stack_samples: Vec<StackSample>,
    pub io_traces: Vec<ResolvedIoTrace>,
}

impl ChunkContribution {
    pub fn sample_count(&self) -> usize {
        self.stack_samples.len() + self.io_traces.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StackKey {
    trace_ctx: String,
    frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IoKey {
    trace_ctx: String,
    source_id: u32,
    trace_type: IoTraceType,
}

#[derive(Debug)]
enum WindowData {
    CpuSample(HashMap<StackKey, u64>),
    IoTrace(HashMap<IoKey, IoTracingProps>),
}

/// Open, mutable window.
#[derive(Debug)]
pub struct AggregationWindow {
    id: WindowId,
    sources: IoSourceLookup,
    contributors: BTreeMap<u64, ContributorInfo>,
    data: WindowData,
    samples: u64,
}

impl AggregationWindow {
    pub fn new(id: WindowId) -> Self {
        let data = match id.work_type {
            WorkType::CpuSample => WindowData::CpuSample(HashMap::new()),
            WorkType::IoTrace => WindowData::IoTrace(HashMap::new()),
        };
        Self {
            id,
            sources: IoSourceLookup::new(),
            contributors: BTreeMap::new(),
            data,
            samples: 0,
        }
    }

    pub fn id(&self) -> &WindowId {
        &self.id
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Apply one chunk atomically. Only data of this window's work type is
    /// taken; the contributor is registered either way.
    pub fn accept(&mut self, contributor: &Contributor, chunk: &ChunkContribution) {
        let mut added = 0u64;
        match &mut self.data {
            WindowData::CpuSample(stacks) => {
                for sample in &chunk.stack_samples {
                    let key = StackKey {
                        trace_ctx: sample.trace_ctx.clone(),
                        frames: sample.frames.clone(),
                    };
                    *stacks.entry(key).or_default() += 1;
                    added += 1;
                }
            }
            WindowData::IoTrace(traces) => {
                for resolved in &chunk.io_traces {
                    let trace_type = resolved.trace.trace_type();
                    let source_id = match &resolved.fd {
                        Some(fd) => self.sources.get_or_add(fd),
                        None => invalid_source_id(trace_type),
                    };
                    let key = IoKey {
                        trace_ctx: resolved.trace.trace_ctx.clone(),
                        source_id,
                        trace_type,
                    };
                    traces.entry(key).or_default().add_sample(
                        resolved.trace.latency_ns,
                        resolved.trace.bytes,
                        resolved.trace.timeout,
                    );
                    added += 1;
                }
            }
        }

        let info = self
            .contributors
            .entry(contributor.work_id)
            .or_insert_with(|| ContributorInfo {
                work_id: contributor.work_id,
                recorder_host: contributor.recorder_host.clone(),
                state: ContributorState::Ongoing,
                chunks: 0,
                samples: 0,
            });
        info.chunks += 1;
        info.samples += added;
        self.samples += added;
    }

    /// Move an ongoing contributor to `state`. Settled contributors keep
    /// their first terminal state.
    pub fn settle_contributor(&mut self, work_id: u64, state: ContributorState) -> bool {
        match self.contributors.get_mut(&work_id) {
            Some(info) if info.state == ContributorState::Ongoing => {
                info.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn contributor(&self, work_id: u64) -> Option<&ContributorInfo> {
        self.contributors.get(&work_id)
    }

    /// Freeze the window. Contributors still streaming become `Partial`.
    pub fn finalize(self) -> FinalizedWindow {
        let contributors = self
            .contributors
            .into_values()
            .map(|mut info| {
                if info.state == ContributorState::Ongoing {
                    info.state = ContributorState::Partial;
                }
                info
            })
            .collect();

        let data = match self.data {
            WindowData::CpuSample(stacks) => {
                let mut counts: Vec<StackCount> = stacks
                    .into_iter()
                    .map(|(key, samples)| StackCount {
                        trace_ctx: key.trace_ctx,
                        frames: key.frames,
                        samples,
                    })
                    .collect();
                counts.sort_by(|a, b| (&a.trace_ctx, &a.frames).cmp(&(&b.trace_ctx, &b.frames)));
                FinalizedData::CpuSample(counts)
            }
            WindowData::IoTrace(traces) => {
                let mut entries: Vec<IoTraceEntry> = traces
                    .into_iter()
                    .map(|(key, props)| IoTraceEntry {
                        trace_ctx: key.trace_ctx,
                        source_id: key.source_id,
                        trace_type: key.trace_type,
                        stats: props.finalize(),
                    })
                    .collect();
                entries.sort_by(|a, b| {
                    (&a.trace_ctx, a.source_id, a.trace_type).cmp(&(
                        &b.trace_ctx,
                        b.source_id,
                        b.trace_type,
                    ))
                });
                FinalizedData::IoTrace(entries)
            }
        };

        FinalizedWindow {
            id: self.id,
            contributors,
            sources: self.sources.generate_reverse_lookup(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackCount {
    pub trace_ctx: String,
    pub frames: Vec<String>,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IoTraceEntry {
    pub trace_ctx: String,
    /// Index into [`FinalizedWindow::sources`].
    pub source_id: u32,
    pub trace_type: IoTraceType,
    pub stats: IoTraceStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizedData {
    CpuSample(Vec<StackCount>),
    IoTrace(Vec<IoTraceEntry>),
}

/// Immutable snapshot of a closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedWindow {
    pub id: WindowId,
    /// Sorted by work id.
    pub contributors: Vec<ContributorInfo>,
    /// Reverse lookup; `sources[id]` is the source assigned `id`.
    pub sources: Vec<IoSource>,
    pub data: FinalizedData,
}

impl FinalizedWindow {
    pub fn sample_count(&self) -> u64 {
        match &self.data {
            FinalizedData::CpuSample(stacks) => stacks.iter().map(|s| s.samples).sum(),
            FinalizedData::IoTrace(entries) => entries.iter().map(|e| e.stats.samples).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.data {
            FinalizedData::CpuSample(stacks) => stacks.is_empty(),
            FinalizedData::IoTrace(entries) => entries.is_empty(),
        }
    }

    /// Distinct trace contexts, sorted.
    pub fn trace_ctxs(&self) -> Vec<String> {
        let mut ctxs: Vec<String> = match &self.data {
            FinalizedData::CpuSample(stacks) => {
                stacks.iter().map(|s| s.trace_ctx.clone()).collect()
            }
            FinalizedData::IoTrace(entries) => {
                entries.iter().map(|e| e.trace_ctx.clone()).collect()
            }
        };
        ctxs.sort_unstable();
        ctxs.dedup();
        ctxs
    }
}
