//! Resumable decoder for checksummed recording frames.
//!
//! The decoder never blocks. When the cursor holds only part of a frame it
//! rewinds to the last mark and reports [`DecodeOutcome::NeedMoreData`]; the
//! caller feeds more bytes and calls [`ChunkDecoder::decode`] again.

use adler2::Adler32;
use prost::Message;
use thiserror::Error;

use super::cursor::{ByteCursor, CursorError};
use super::wire::RecordingChunk;
use crate::error::FailureKind;

/// Default upper bound on a single encoded chunk.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Non-fatal result of a decode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A full chunk was decoded and its checksum verified.
    Complete,
    /// The buffered bytes end mid-frame.
    NeedMoreData,
    /// The zero-length end marker was read.
    EndOfStream,
}

/// Fatal decode failures. The stream cannot be resynchronized after any of
/// these.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("checksum mismatch: frame carries {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: u64, max: usize },

    #[error("malformed length prefix")]
    MalformedLength,

    #[error("malformed recording chunk: {0}")]
    Malformed(#[from] prost::DecodeError),
}

impl DecodeError {
    /// Metric label for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::MalformedLength => "malformed_length",
            Self::Malformed(_) => "malformed_chunk",
        }
    }

    /// Corrupt input is always the sender's fault.
    pub fn failure_kind(&self) -> FailureKind {
        FailureKind::Client
    }
}

enum State {
    AwaitingMessage,
    AwaitingChecksum(RecordingChunk),
    Complete(RecordingChunk),
    EndOfStream,
}

/// Per-connection frame decoder.
pub struct ChunkDecoder {
    max_message_size: usize,
    state: State,
    checksum: Adler32,
}

impl ChunkDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: State::AwaitingMessage,
            checksum: Adler32::new(),
        }
    }

    /// Advance decoding over the bytes buffered in `cursor`.
    ///
    /// Once `Complete` is returned, further calls keep returning `Complete`
    /// until the chunk is taken with [`take`](Self::take). `EndOfStream` is
    /// sticky until [`reset`](Self::reset).
    pub fn decode(&mut self, cursor: &mut ByteCursor) -> Result<DecodeOutcome, DecodeError> {
        match self.state {
            State::Complete(_) => return Ok(DecodeOutcome::Complete),
            State::EndOfStream => return Ok(DecodeOutcome::EndOfStream),
            State::AwaitingMessage | State::AwaitingChecksum(_) => {}
        }

        if matches!(self.state, State::AwaitingMessage) {
            cursor.mark();
            cursor.discard_before_mark();

            let size = match cursor.read_varint() {
                Ok(size) => size,
                Err(CursorError::Insufficient { .. }) => {
                    cursor.reset_to_mark();
                    return Ok(DecodeOutcome::NeedMoreData);
                }
                Err(CursorError::MalformedVarint) => return Err(DecodeError::MalformedLength),
            };

            if size == 0 {
                self.state = State::EndOfStream;
                return Ok(DecodeOutcome::EndOfStream);
            }

            let len = usize::try_from(size)
                .ok()
                .filter(|&len| len <= self.max_message_size)
                .ok_or(DecodeError::MessageTooLarge {
                    size,
                    max: self.max_message_size,
                })?;

            let chunk = match cursor.read_slice(len) {
                Ok(payload) => RecordingChunk::decode(payload)?,
                Err(_) => {
                    cursor.reset_to_mark();
                    return Ok(DecodeOutcome::NeedMoreData);
                }
            };

            cursor.checksum_since_mark(&mut self.checksum);
            self.state = State::AwaitingChecksum(chunk);
        }

        cursor.mark();
        let expected = match cursor.read_u32_le() {
            Ok(value) => value,
            Err(_) => {
                cursor.reset_to_mark();
                return Ok(DecodeOutcome::NeedMoreData);
            }
        };

        let computed = self.checksum.checksum();
        if expected != computed {
            return Err(DecodeError::ChecksumMismatch { expected, computed });
        }

        if let State::AwaitingChecksum(chunk) =
            std::mem::replace(&mut self.state, State::AwaitingMessage)
        {
            self.state = State::Complete(chunk);
        }
        Ok(DecodeOutcome::Complete)
    }

    /// The decoded chunk, if decoding has completed.
    pub fn get(&self) -> Option<&RecordingChunk> {
        match &self.state {
            State::Complete(chunk) => Some(chunk),
            _ => None,
        }
    }

    /// Take the decoded chunk and prepare for the next frame.
    pub fn take(&mut self) -> Option<RecordingChunk> {
        if !matches!(self.state, State::Complete(_)) {
            return None;
        }
        match std::mem::replace(&mut self.state, State::AwaitingMessage) {
            State::Complete(chunk) => {
                self.checksum = Adler32::new();
                Some(chunk)
            }
            _ => None,
        }
    }

    /// Whether the end-of-stream marker has been read.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.state, State::EndOfStream)
    }

    /// Drop any decoded or partially decoded chunk and clear the checksum.
    pub fn reset(&mut self) {
        self.state = State::AwaitingMessage;
        self.checksum = Adler32::new();
    }
}
