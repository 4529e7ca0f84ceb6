//! Transport-agnostic ingest session for one recording stream.
//!
//! A session owns one cursor and one decoder. Bytes are pushed in with
//! [`Session::feed`]; every complete chunk is applied to the window registry
//! before the next one is decoded.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prost::Message;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cursor::ByteCursor;
use super::parse::{ChunkDecoder, DecodeError, DecodeOutcome};
use super::wire::{FdInfo, RecordingChunk, RecordingHeader};
use crate::aggregation::registry::WindowRegistry;
use crate::aggregation::window::{ChunkContribution, Contributor, ProcessGroup, ResolvedIoTrace};
use crate::error::FailureKind;
use crate::export::health::HealthMetrics;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("first recording chunk carries no header")]
    MissingHeader,

    #[error("recording header changed mid-stream (work {expected} became {found})")]
    HeaderMismatch { expected: u64, found: u64 },

    #[error("{count} bytes received after end of stream")]
    DataAfterEnd { count: usize },

    #[error("connection closed mid-stream with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },

    #[error("reading from connection: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Metric label for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.as_str(),
            Self::MissingHeader => "missing_header",
            Self::HeaderMismatch { .. } => "header_mismatch",
            Self::DataAfterEnd { .. } => "data_after_end",
            Self::UnexpectedEof { .. } => "unexpected_eof",
            Self::Io(_) => "io",
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Io(_) => FailureKind::Server,
            _ => FailureKind::Client,
        }
    }
}

/// Where the stream stands after a call to [`Session::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Waiting for more bytes.
    Open,
    /// End-of-stream marker received; the contributor is completed.
    Finished,
}

/// One agent's recording stream.
pub struct Session {
    registry: Arc<WindowRegistry>,
    health: Option<Arc<HealthMetrics>>,
    cursor: ByteCursor,
    decoder: ChunkDecoder,
    contributor: Option<Contributor>,
    fds: HashMap<u64, FdInfo>,
    chunks: u64,
    finished: bool,
    aborted: bool,
}

impl Session {
    pub fn new(registry: Arc<WindowRegistry>, max_message_size: usize) -> Self {
        Self {
            registry,
            health: None,
            cursor: ByteCursor::new(),
            decoder: ChunkDecoder::new(max_message_size),
            contributor: None,
            fds: HashMap::new(),
            chunks: 0,
            finished: false,
            aborted: false,
        }
    }

    /// Record decode progress into `health`.
    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Identity announced by the stream's first chunk.
    pub fn contributor(&self) -> Option<&Contributor> {
        self.contributor.as_ref()
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Push received bytes, stamping chunks with the current time.
    pub fn feed(&mut self, data: &[u8]) -> Result<SessionStatus, IngestError> {
        self.feed_at(data, Utc::now())
    }

    /// Push received bytes, assigning complete chunks to the bucket open at
    /// `now`. Any error aborts the contributor; the session must then be
    /// dropped.
    pub fn feed_at(
        &mut self,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, IngestError> {
        if self.finished {
            if data.is_empty() {
                return Ok(SessionStatus::Finished);
            }
            return Err(IngestError::DataAfterEnd { count: data.len() });
        }

        self.cursor.feed(data);
        match self.drain(now) {
            Ok(status) => Ok(status),
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    /// The peer closed the connection. Clean only after the end marker.
    pub fn close(&mut self) -> Result<(), IngestError> {
        if self.finished {
            return Ok(());
        }
        let err = IngestError::UnexpectedEof {
            buffered: self.cursor.remaining(),
        };
        self.abort(&err);
        Err(err)
    }

    /// Mark the contributor aborted after a failure outside the decoder.
    pub fn abort(&mut self, reason: &IngestError) {
        if self.aborted || self.finished {
            return;
        }
        self.aborted = true;
        if let Some(health) = &self.health {
            health.streams_aborted.inc();
            health
                .decode_errors
                .with_label_values(&[reason.as_str()])
                .inc();
        }
        if let Some(contributor) = &self.contributor {
            warn!(
                group = %contributor.group,
                work_id = contributor.work_id,
                chunks = self.chunks,
                error = %reason,
                "recording stream aborted",
            );
            self.registry
                .mark_aborted(&contributor.group, contributor.work_id);
        } else {
            warn!(error = %reason, "recording stream aborted before header");
        }
    }

    fn drain(&mut self, now: DateTime<Utc>) -> Result<SessionStatus, IngestError> {
        loop {
            match self.decoder.decode(&mut self.cursor)? {
                DecodeOutcome::NeedMoreData => return Ok(SessionStatus::Open),
                DecodeOutcome::Complete => {
                    if let Some(chunk) = self.decoder.take() {
                        self.apply(chunk, now)?;
                    }
                }
                DecodeOutcome::EndOfStream => {
                    self.finish();
                    let trailing = self.cursor.remaining();
                    if trailing > 0 {
                        return Err(IngestError::DataAfterEnd { count: trailing });
                    }
                    return Ok(SessionStatus::Finished);
                }
            }
        }
    }

    fn apply(&mut self, chunk: RecordingChunk, now: DateTime<Utc>) -> Result<(), IngestError> {
        if let Some(health) = &self.health {
            health.chunks_decoded.inc();
            health.chunk_size_bytes.observe(chunk.encoded_len() as f64);
        }

        let RecordingChunk {
            header,
            fd_infos,
            io_traces,
            stack_samples,
        } = chunk;

        match header {
            Some(header) => match &self.contributor {
                None => self.start(header),
                Some(current) => {
                    let same_group = current.group.app_id == header.app_id
                        && current.group.cluster_id == header.cluster_id
                        && current.group.proc_name == header.proc_name;
                    if !same_group || current.work_id != header.work_id {
                        return Err(IngestError::HeaderMismatch {
                            expected: current.work_id,
                            found: header.work_id,
                        });
                    }
                }
            },
            None if self.contributor.is_none() => return Err(IngestError::MissingHeader),
            None => {}
        }

        for fd in fd_infos {
            self.fds.insert(fd.id, fd);
        }

        let io_traces = io_traces
            .into_iter()
            .map(|trace| ResolvedIoTrace {
                fd: self.fds.get(&trace.fd_id).cloned(),
                trace,
            })
            .collect();
        let contribution = ChunkContribution {
            stack_samples,
            io_traces,
        };

        if let Some(contributor) = &self.contributor {
            self.registry.accept(contributor, &contribution, now);
        }
        self.chunks += 1;
        Ok(())
    }

    fn start(&mut self, header: RecordingHeader) {
        let contributor = Contributor {
            group: ProcessGroup {
                app_id: header.app_id,
                cluster_id: header.cluster_id,
                proc_name: header.proc_name,
            },
            work_id: header.work_id,
            recorder_host: header.recorder_host,
        };
        info!(
            group = %contributor.group,
            work_id = contributor.work_id,
            recorder = %contributor.recorder_host,
            "recording stream started",
        );
        self.contributor = Some(contributor);
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(health) = &self.health {
            health.streams_completed.inc();
        }
        match &self.contributor {
            Some(contributor) => {
                debug!(
                    group = %contributor.group,
                    work_id = contributor.work_id,
                    chunks = self.chunks,
                    "recording stream completed",
                );
                self.registry
                    .mark_completed(&contributor.group, contributor.work_id);
            }
            None => debug!("empty recording stream completed"),
        }
    }
}
