//! Recording messages streamed by profiling agents.
//!
//! Each frame on the wire is
//! `[varint length][RecordingChunk][u32 LE adler32 of length + message]`.
//! A lone zero length byte marks the end of the stream.

use adler2::Adler32;
use prost::Message;

/// Single zero-length prefix terminating a recording stream.
pub const END_OF_STREAM: [u8; 1] = [0];

/// Kind of descriptor an I/O trace refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FdType {
    File = 0,
    FileNio = 1,
    Socket = 2,
    SocketNio = 3,
}

impl FdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::FileNio => "filenio",
            Self::Socket => "socket",
            Self::SocketNio => "socketnio",
        }
    }

    pub fn is_socket(self) -> bool {
        matches!(self, Self::Socket | Self::SocketNio)
    }
}

/// Direction of an I/O operation on a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum IoTraceType {
    FileRead = 0,
    FileWrite = 1,
    SocketRead = 2,
    SocketWrite = 3,
}

impl IoTraceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::SocketRead => "socket_read",
            Self::SocketWrite => "socket_write",
        }
    }

    pub fn is_socket(self) -> bool {
        matches!(self, Self::SocketRead | Self::SocketWrite)
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub filename: String,
    #[prost(string, tag = "2")]
    pub flags: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SocketInfo {
    #[prost(string, tag = "1")]
    pub address: String,
    /// True for outbound (connected) sockets, false for accepted ones.
    #[prost(bool, tag = "2")]
    pub connect: bool,
}

/// Descriptor announcement. Later I/O traces refer to it by `id`.
#[derive(Clone, PartialEq, Message)]
pub struct FdInfo {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(enumeration = "FdType", tag = "2")]
    pub fd_type: i32,
    #[prost(message, optional, tag = "3")]
    pub file_info: Option<FileInfo>,
    #[prost(message, optional, tag = "4")]
    pub socket_info: Option<SocketInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct IoTrace {
    #[prost(uint64, tag = "1")]
    pub fd_id: u64,
    #[prost(enumeration = "IoTraceType", tag = "2")]
    pub trace_type: i32,
    #[prost(uint64, tag = "3")]
    pub latency_ns: u64,
    #[prost(int32, tag = "4")]
    pub bytes: i32,
    #[prost(bool, tag = "5")]
    pub timeout: bool,
    #[prost(string, tag = "6")]
    pub trace_ctx: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StackSample {
    #[prost(string, tag = "1")]
    pub trace_ctx: String,
    /// Frames ordered from the innermost call outwards.
    #[prost(string, repeated, tag = "2")]
    pub frames: Vec<String>,
}

/// Identity of the process and agent producing a recording.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RecordingHeader {
    #[prost(uint64, tag = "1")]
    pub work_id: u64,
    #[prost(string, tag = "2")]
    pub app_id: String,
    #[prost(string, tag = "3")]
    pub cluster_id: String,
    #[prost(string, tag = "4")]
    pub proc_name: String,
    #[prost(string, tag = "5")]
    pub recorder_host: String,
}

/// One decoded unit of a recording stream.
#[derive(Clone, PartialEq, Message)]
pub struct RecordingChunk {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RecordingHeader>,
    #[prost(message, repeated, tag = "2")]
    pub fd_infos: Vec<FdInfo>,
    #[prost(message, repeated, tag = "3")]
    pub io_traces: Vec<IoTrace>,
    #[prost(message, repeated, tag = "4")]
    pub stack_samples: Vec<StackSample>,
}

/// Encode `chunk` as a checksummed frame. An empty chunk encodes to the
/// end-of-stream marker followed by nothing else.
pub fn encode_frame(chunk: &RecordingChunk) -> Vec<u8> {
    if chunk.encoded_len() == 0 {
        return END_OF_STREAM.to_vec();
    }
    let mut frame = chunk.encode_length_delimited_to_vec();
    let mut acc = Adler32::new();
    acc.write_slice(&frame);
    frame.extend_from_slice(&acc.checksum().to_le_bytes());
    frame
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let chunk = RecordingChunk {
            stack_samples: vec![StackSample {
                trace_ctx: "http".into(),
                frames: vec!["main".into()],
            }],
            ..Default::default()
        };
        let frame = encode_frame(&chunk);
        let body_len = chunk.encoded_len();

        assert_eq!(usize::from(frame[0]), body_len);
        assert_eq!(frame.len(), 1 + body_len + 4);

        let mut acc = Adler32::new();
        acc.write_slice(&frame[..1 + body_len]);
        assert_eq!(frame[1 + body_len..], acc.checksum().to_le_bytes());
    }

    #[test]
    fn test_empty_chunk_is_end_marker() {
        assert_eq!(encode_frame(&RecordingChunk::default()), vec![0]);
    }

    #[test]
    fn test_enum_accessors() {
        let fd = FdInfo {
            id: 1,
            fd_type: FdType::SocketNio as i32,
            file_info: None,
            socket_info: None,
        };
        assert_eq!(fd.fd_type(), FdType::SocketNio);
        assert!(fd.fd_type().is_socket());
        assert_eq!(IoTraceType::FileWrite.as_str(), "file_write");
    }
}
