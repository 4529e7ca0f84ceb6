//! Binary artifact format for finalized windows and bucket summaries.
//!
//! An artifact is gzip over:
//!
//! ```text
//! varint magic
//! varint len | ArtifactHeader | u32 LE adler32 of (len | header)
//! varint len | body           | u32 LE adler32 of (len | body)
//! ```

use std::io::{Read, Write};

use adler2::Adler32;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use thiserror::Error;

use super::key::SCHEMA_VERSION;
use super::summary::{WindowSummary, WorkSummary};
use crate::aggregation::io_props::IoTraceStats;
use crate::aggregation::io_source::{IoSource, SocketDirection};
use crate::aggregation::window::{
    ContributorInfo, ContributorState, FinalizedData, FinalizedWindow, IoTraceEntry,
    ProcessGroup, StackCount, WindowId, WorkType,
};
use crate::ingest::cursor::ByteCursor;
use crate::ingest::wire::{FdType, IoTraceType};

pub const WINDOW_MAGIC: u64 = 0x0019_7e7c;
pub const SUMMARY_MAGIC: u64 = 0x0019_7e7d;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unexpected magic number {found:#x}")]
    BadMagic { found: u64 },

    #[error("artifact version {found} is not supported (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("truncated {section}")]
    Truncated { section: &'static str },

    #[error("{section} checksum mismatch")]
    ChecksumMismatch { section: &'static str },

    #[error("decoding {section}: {source}")]
    Decode {
        section: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },

    #[error("{count} trailing bytes after body")]
    TrailingBytes { count: usize },

    #[error("gzip: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, PartialEq, Message)]
struct ArtifactHeader {
    #[prost(uint32, tag = "1")]
    version: u32,
    #[prost(string, tag = "2")]
    app_id: String,
    #[prost(string, tag = "3")]
    cluster_id: String,
    #[prost(string, tag = "4")]
    proc_name: String,
    #[prost(int64, tag = "5")]
    start_secs: i64,
    #[prost(uint32, tag = "6")]
    duration_secs: u32,
    #[prost(uint32, optional, tag = "7")]
    work_type: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
struct ContributorRecord {
    #[prost(uint64, tag = "1")]
    work_id: u64,
    #[prost(string, tag = "2")]
    recorder_host: String,
    #[prost(uint32, tag = "3")]
    state: u32,
    #[prost(uint64, tag = "4")]
    chunks: u64,
    #[prost(uint64, tag = "5")]
    samples: u64,
}

#[derive(Clone, PartialEq, Message)]
struct SourceRecord {
    #[prost(enumeration = "FdType", tag = "1")]
    fd_type: i32,
    #[prost(string, tag = "2")]
    uri: String,
    /// 0 = none, 1 = inbound, 2 = outbound.
    #[prost(uint32, tag = "3")]
    direction: u32,
}

#[derive(Clone, PartialEq, Message)]
struct StackRecord {
    #[prost(string, tag = "1")]
    trace_ctx: String,
    #[prost(string, repeated, tag = "2")]
    frames: Vec<String>,
    #[prost(uint64, tag = "3")]
    samples: u64,
}

#[derive(Clone, PartialEq, Message)]
struct IoTraceRecord {
    #[prost(string, tag = "1")]
    trace_ctx: String,
    #[prost(uint32, tag = "2")]
    source_id: u32,
    #[prost(enumeration = "IoTraceType", tag = "3")]
    trace_type: i32,
    #[prost(uint64, tag = "4")]
    samples: u64,
    #[prost(uint64, tag = "5")]
    bytes: u64,
    #[prost(uint64, tag = "6")]
    timeouts: u64,
    #[prost(uint64, tag = "7")]
    latency_sum_ns: u64,
    #[prost(double, tag = "8")]
    mean_ns: f64,
    #[prost(double, tag = "9")]
    p95_ns: f64,
    #[prost(double, tag = "10")]
    p99_ns: f64,
    #[prost(bool, tag = "11")]
    dropped: bool,
}

#[derive(Clone, PartialEq, Message)]
struct WindowBody {
    #[prost(message, repeated, tag = "1")]
    contributors: Vec<ContributorRecord>,
    #[prost(message, repeated, tag = "2")]
    sources: Vec<SourceRecord>,
    #[prost(message, repeated, tag = "3")]
    stacks: Vec<StackRecord>,
    #[prost(message, repeated, tag = "4")]
    io_traces: Vec<IoTraceRecord>,
}

#[derive(Clone, PartialEq, Message)]
struct WorkRecord {
    #[prost(uint32, tag = "1")]
    work_type: u32,
    #[prost(message, repeated, tag = "2")]
    contributors: Vec<ContributorRecord>,
    #[prost(string, repeated, tag = "3")]
    trace_ctxs: Vec<String>,
    #[prost(uint64, tag = "4")]
    sample_count: u64,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryBody {
    #[prost(message, repeated, tag = "1")]
    works: Vec<WorkRecord>,
}

// --- Public entry points ---

pub fn encode_window(window: &FinalizedWindow) -> Result<Vec<u8>, CodecError> {
    let id = &window.id;
    let header = header_for(
        &id.group,
        id.start,
        id.duration_secs,
        Some(u32::from(id.work_type.as_u8())),
    );

    let mut body = WindowBody {
        contributors: window.contributors.iter().map(contributor_record).collect(),
        sources: window.sources.iter().map(source_record).collect(),
        stacks: Vec::new(),
        io_traces: Vec::new(),
    };
    match &window.data {
        FinalizedData::CpuSample(stacks) => {
            body.stacks = stacks
                .iter()
                .map(|s| StackRecord {
                    trace_ctx: s.trace_ctx.clone(),
                    frames: s.frames.clone(),
                    samples: s.samples,
                })
                .collect();
        }
        FinalizedData::IoTrace(entries) => {
            body.io_traces = entries.iter().map(io_trace_record).collect();
        }
    }

    encode_artifact(WINDOW_MAGIC, &header, &body)
}

pub fn decode_window(data: &[u8]) -> Result<FinalizedWindow, CodecError> {
    let (header, body): (ArtifactHeader, WindowBody) = decode_artifact(data, WINDOW_MAGIC)?;

    let raw_work_type = header.work_type.ok_or(CodecError::InvalidField {
        field: "work_type",
        value: -1,
    })?;
    let work_type = work_type_from(raw_work_type)?;
    let start = start_from(header.start_secs)?;

    let contributors = body
        .contributors
        .into_iter()
        .map(contributor_from)
        .collect::<Result<Vec<_>, _>>()?;
    let sources = body
        .sources
        .into_iter()
        .map(source_from)
        .collect::<Result<Vec<_>, _>>()?;

    let data = match work_type {
        WorkType::CpuSample => FinalizedData::CpuSample(
            body.stacks
                .into_iter()
                .map(|s| StackCount {
                    trace_ctx: s.trace_ctx,
                    frames: s.frames,
                    samples: s.samples,
                })
                .collect(),
        ),
        WorkType::IoTrace => FinalizedData::IoTrace(
            body.io_traces
                .into_iter()
                .map(io_trace_from)
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };

    Ok(FinalizedWindow {
        id: WindowId {
            group: ProcessGroup {
                app_id: header.app_id,
                cluster_id: header.cluster_id,
                proc_name: header.proc_name,
            },
            start,
            duration_secs: header.duration_secs,
            work_type,
        },
        contributors,
        sources,
        data,
    })
}

pub fn encode_summary(summary: &WindowSummary) -> Result<Vec<u8>, CodecError> {
    let header = header_for(&summary.group, summary.start, summary.duration_secs, None);
    let body = SummaryBody {
        works: summary
            .works
            .iter()
            .map(|w| WorkRecord {
                work_type: u32::from(w.work_type.as_u8()),
                contributors: w.contributors.iter().map(contributor_record).collect(),
                trace_ctxs: w.trace_ctxs.clone(),
                sample_count: w.sample_count,
            })
            .collect(),
    };
    encode_artifact(SUMMARY_MAGIC, &header, &body)
}

pub fn decode_summary(data: &[u8]) -> Result<WindowSummary, CodecError> {
    let (header, body): (ArtifactHeader, SummaryBody) = decode_artifact(data, SUMMARY_MAGIC)?;

    let works = body
        .works
        .into_iter()
        .map(|w| -> Result<WorkSummary, CodecError> {
            Ok(WorkSummary {
                work_type: work_type_from(w.work_type)?,
                contributors: w
                    .contributors
                    .into_iter()
                    .map(contributor_from)
                    .collect::<Result<Vec<_>, _>>()?,
                trace_ctxs: w.trace_ctxs,
                sample_count: w.sample_count,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WindowSummary {
        start: start_from(header.start_secs)?,
        group: ProcessGroup {
            app_id: header.app_id,
            cluster_id: header.cluster_id,
            proc_name: header.proc_name,
        },
        duration_secs: header.duration_secs,
        works,
    })
}

// --- Framing ---

fn encode_artifact<B: Message>(
    magic: u64,
    header: &ArtifactHeader,
    body: &B,
) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::with_capacity(header.encoded_len() + body.encoded_len() + 32);
    prost::encoding::encode_varint(magic, &mut raw);
    write_section(&mut raw, header);
    write_section(&mut raw, body);

    let mut gz = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    gz.write_all(&raw)?;
    Ok(gz.finish()?)
}

fn write_section<M: Message>(out: &mut Vec<u8>, msg: &M) {
    let section = msg.encode_length_delimited_to_vec();
    let mut acc = Adler32::new();
    acc.write_slice(&section);
    out.extend_from_slice(&section);
    out.extend_from_slice(&acc.checksum().to_le_bytes());
}

fn decode_artifact<B: Message + Default>(
    data: &[u8],
    magic: u64,
) -> Result<(ArtifactHeader, B), CodecError> {
    let mut raw = Vec::new();
    GzDecoder::new(data).read_to_end(&mut raw)?;

    let mut cursor = ByteCursor::from(raw);
    let found = cursor
        .read_varint()
        .map_err(|_| CodecError::Truncated { section: "magic" })?;
    if found != magic {
        return Err(CodecError::BadMagic { found });
    }

    let header: ArtifactHeader = read_section(&mut cursor, "header")?;
    if header.version != SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: header.version,
            supported: SCHEMA_VERSION,
        });
    }

    let body: B = read_section(&mut cursor, "body")?;
    if cursor.remaining() != 0 {
        return Err(CodecError::TrailingBytes {
            count: cursor.remaining(),
        });
    }
    Ok((header, body))
}

fn read_section<M: Message + Default>(
    cursor: &mut ByteCursor,
    section: &'static str,
) -> Result<M, CodecError> {
    let truncated = |_| CodecError::Truncated { section };

    cursor.mark();
    let len = cursor.read_varint().map_err(truncated)?;
    let len = usize::try_from(len).map_err(|_| CodecError::Truncated { section })?;
    let msg = {
        let payload = cursor.read_slice(len).map_err(truncated)?;
        M::decode(payload).map_err(|source| CodecError::Decode { section, source })?
    };

    let mut acc = Adler32::new();
    cursor.checksum_since_mark(&mut acc);
    let expected = cursor.read_u32_le().map_err(truncated)?;
    if expected != acc.checksum() {
        return Err(CodecError::ChecksumMismatch { section });
    }
    Ok(msg)
}

// --- Record conversions ---

fn header_for(
    group: &ProcessGroup,
    start: DateTime<Utc>,
    duration_secs: u32,
    work_type: Option<u32>,
) -> ArtifactHeader {
    ArtifactHeader {
        version: SCHEMA_VERSION,
        app_id: group.app_id.clone(),
        cluster_id: group.cluster_id.clone(),
        proc_name: group.proc_name.clone(),
        start_secs: start.timestamp(),
        duration_secs,
        work_type,
    }
}

fn start_from(secs: i64) -> Result<DateTime<Utc>, CodecError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(CodecError::InvalidField {
            field: "start_secs",
            value: secs,
        })
}

fn work_type_from(raw: u32) -> Result<WorkType, CodecError> {
    u8::try_from(raw)
        .ok()
        .and_then(WorkType::from_u8)
        .ok_or(CodecError::InvalidField {
            field: "work_type",
            value: i64::from(raw),
        })
}

fn contributor_record(info: &ContributorInfo) -> ContributorRecord {
    ContributorRecord {
        work_id: info.work_id,
        recorder_host: info.recorder_host.clone(),
        state: u32::from(info.state.as_u8()),
        chunks: info.chunks,
        samples: info.samples,
    }
}

fn contributor_from(record: ContributorRecord) -> Result<ContributorInfo, CodecError> {
    let state = u8::try_from(record.state)
        .ok()
        .and_then(ContributorState::from_u8)
        .ok_or(CodecError::InvalidField {
            field: "contributor_state",
            value: i64::from(record.state),
        })?;
    Ok(ContributorInfo {
        work_id: record.work_id,
        recorder_host: record.recorder_host,
        state,
        chunks: record.chunks,
        samples: record.samples,
    })
}

fn source_record(source: &IoSource) -> SourceRecord {
    SourceRecord {
        fd_type: source.fd_type as i32,
        uri: source.uri.clone(),
        direction: match source.direction {
            None => 0,
            Some(SocketDirection::Inbound) => 1,
            Some(SocketDirection::Outbound) => 2,
        },
    }
}

fn source_from(record: SourceRecord) -> Result<IoSource, CodecError> {
    let fd_type = FdType::try_from(record.fd_type).map_err(|_| CodecError::InvalidField {
        field: "fd_type",
        value: i64::from(record.fd_type),
    })?;
    let direction = match record.direction {
        0 => None,
        1 => Some(SocketDirection::Inbound),
        2 => Some(SocketDirection::Outbound),
        other => {
            return Err(CodecError::InvalidField {
                field: "direction",
                value: i64::from(other),
            })
        }
    };
    Ok(IoSource {
        fd_type,
        uri: record.uri,
        direction,
    })
}

fn io_trace_record(entry: &IoTraceEntry) -> IoTraceRecord {
    let stats = &entry.stats;
    IoTraceRecord {
        trace_ctx: entry.trace_ctx.clone(),
        source_id: entry.source_id,
        trace_type: entry.trace_type as i32,
        samples: stats.samples,
        bytes: stats.bytes,
        timeouts: stats.timeouts,
        latency_sum_ns: stats.latency_sum_ns,
        mean_ns: stats.mean_ns,
        p95_ns: stats.p95_ns,
        p99_ns: stats.p99_ns,
        dropped: stats.dropped,
    }
}

fn io_trace_from(record: IoTraceRecord) -> Result<IoTraceEntry, CodecError> {
    let trace_type =
        IoTraceType::try_from(record.trace_type).map_err(|_| CodecError::InvalidField {
            field: "trace_type",
            value: i64::from(record.trace_type),
        })?;
    Ok(IoTraceEntry {
        trace_ctx: record.trace_ctx,
        source_id: record.source_id,
        trace_type,
        stats: IoTraceStats {
            samples: record.samples,
            bytes: record.bytes,
            timeouts: record.timeouts,
            latency_sum_ns: record.latency_sum_ns,
            mean_ns: record.mean_ns,
            p95_ns: record.p95_ns,
            p99_ns: record.p99_ns,
            dropped: record.dropped,
        },
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::aggregation::window::{AggregationWindow, ChunkContribution, Contributor};
    use crate::ingest::wire::StackSample;

    fn finalized_cpu_window() -> FinalizedWindow {
        let mut window = AggregationWindow::new(WindowId {
            group: ProcessGroup::new("app1", "cluster1", "proc1"),
            start: Utc.timestamp_opt(1_800 * 1000, 0).unwrap(),
            duration_secs: 1800,
            work_type: WorkType::CpuSample,
        });
        window.accept(
            &Contributor {
                group: ProcessGroup::new("app1", "cluster1", "proc1"),
                work_id: 42,
                recorder_host: "10.0.0.9".into(),
            },
            &ChunkContribution {
                stack_samples: vec![StackSample {
                    trace_ctx: "inference".into(),
                    frames: vec!["matmul".into(), "main".into()],
                }],
                io_traces: Vec::new(),
            },
        );
        window.finalize()
    }

    /// Gunzip, apply `edit`, gzip again.
    fn tamper(artifact: &[u8], edit: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut raw = Vec::new();
        GzDecoder::new(artifact).read_to_end(&mut raw).unwrap();
        edit(&mut raw);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw).unwrap();
        gz.finish().unwrap()
    }

    #[test]
    fn test_window_artifact_decodes_to_equal_window() {
        let window = finalized_cpu_window();
        let artifact = encode_window(&window).unwrap();
        assert_eq!(decode_window(&artifact).unwrap(), window);
    }

    #[test]
    fn test_summary_magic_is_not_a_window() {
        let window = finalized_cpu_window();
        let mut summary = WindowSummary::for_window(&window);
        summary.merge(WorkSummary::from_window(&window));
        let artifact = encode_summary(&summary).unwrap();

        assert!(matches!(
            decode_window(&artifact),
            Err(CodecError::BadMagic { found: SUMMARY_MAGIC })
        ));
        assert_eq!(decode_summary(&artifact).unwrap(), summary);
    }

    #[test]
    fn test_flipped_body_byte_fails_checksum() {
        let artifact = encode_window(&finalized_cpu_window()).unwrap();
        // The footer is the last four bytes; flip one inside it.
        let corrupted = tamper(&artifact, |raw| {
            let last = raw.len() - 1;
            raw[last] ^= 0x01;
        });
        assert!(matches!(
            decode_window(&corrupted),
            Err(CodecError::ChecksumMismatch { section: "body" })
        ));
    }

    #[test]
    fn test_future_version_is_rejected() {
        let window = finalized_cpu_window();
        let mut header = header_for(&window.id.group, window.id.start, 1800, Some(0));
        header.version = SCHEMA_VERSION + 1;
        let artifact = encode_artifact(WINDOW_MAGIC, &header, &WindowBody::default()).unwrap();

        assert!(matches!(
            decode_window(&artifact),
            Err(CodecError::UnsupportedVersion { found, .. }) if found == SCHEMA_VERSION + 1
        ));
    }

    #[test]
    fn test_truncated_artifact() {
        let artifact = encode_window(&finalized_cpu_window()).unwrap();
        let truncated = tamper(&artifact, |raw| raw.truncate(raw.len() - 2));
        assert!(matches!(
            decode_window(&truncated),
            Err(CodecError::Truncated { section: "body" })
        ));
    }

    #[test]
    fn test_not_gzip() {
        assert!(matches!(
            decode_window(b"definitely not gzip"),
            Err(CodecError::Io(_))
        ));
    }
}
