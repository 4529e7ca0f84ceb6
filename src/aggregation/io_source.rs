//! Dense id assignment for I/O sources seen within one aggregation window.

use std::collections::HashMap;

use crate::ingest::wire::{FdInfo, FdType, IoTraceType};

/// Number of ids reserved for the invalid-source sentinels.
pub const RESERVED_SOURCE_IDS: u32 = 4;

pub const FILE_INVALID_ID: u32 = 0;
pub const FILE_NIO_INVALID_ID: u32 = 1;
pub const SOCKET_INVALID_ID: u32 = 2;
pub const SOCKET_NIO_INVALID_ID: u32 = 3;

const INVALID_FILE_URI: &str = "Invalid File";
const INVALID_SOCKET_URI: &str = "Invalid Socket";

/// Which end opened a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketDirection {
    /// Accepted from a remote peer.
    Inbound,
    /// Connected to a remote peer.
    Outbound,
}

impl SocketDirection {
    pub fn from_connect(connect: bool) -> Self {
        if connect {
            Self::Outbound
        } else {
            Self::Inbound
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Identity of an I/O source. File flags never participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoSource {
    pub fd_type: FdType,
    /// File name or socket address.
    pub uri: String,
    /// Set for sockets only.
    pub direction: Option<SocketDirection>,
}

impl IoSource {
    fn sentinel(fd_type: FdType, uri: &str) -> Self {
        Self {
            fd_type,
            uri: uri.to_string(),
            direction: None,
        }
    }

    /// Build the dedup key for a descriptor announcement. A descriptor with
    /// neither file nor socket details keys on its type and an empty uri.
    pub fn from_fd_info(fd: &FdInfo) -> Self {
        let fd_type = fd.fd_type();
        if let Some(file) = &fd.file_info {
            return Self {
                fd_type,
                uri: file.filename.clone(),
                direction: None,
            };
        }
        if let Some(socket) = &fd.socket_info {
            return Self {
                fd_type,
                uri: socket.address.clone(),
                direction: Some(SocketDirection::from_connect(socket.connect)),
            };
        }
        Self {
            fd_type,
            uri: String::new(),
            direction: None,
        }
    }
}

/// Sentinel id for a trace whose descriptor was never announced.
pub fn invalid_source_id(trace_type: IoTraceType) -> u32 {
    if trace_type.is_socket() {
        SOCKET_INVALID_ID
    } else {
        FILE_INVALID_ID
    }
}

/// Assigns sequential ids to distinct I/O sources.
///
/// Ids `0..RESERVED_SOURCE_IDS` are the invalid sentinels; real sources get
/// `RESERVED_SOURCE_IDS, RESERVED_SOURCE_IDS + 1, ...` in first-seen order.
/// Not synchronized; the owning window serializes access.
#[derive(Debug, Clone, PartialEq)]
pub struct IoSourceLookup {
    ids: HashMap<IoSource, u32>,
    next_id: u32,
}

impl Default for IoSourceLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSourceLookup {
    pub fn new() -> Self {
        let mut ids = HashMap::new();
        ids.insert(IoSource::sentinel(FdType::File, INVALID_FILE_URI), FILE_INVALID_ID);
        ids.insert(
            IoSource::sentinel(FdType::FileNio, INVALID_FILE_URI),
            FILE_NIO_INVALID_ID,
        );
        ids.insert(
            IoSource::sentinel(FdType::Socket, INVALID_SOCKET_URI),
            SOCKET_INVALID_ID,
        );
        ids.insert(
            IoSource::sentinel(FdType::SocketNio, INVALID_SOCKET_URI),
            SOCKET_NIO_INVALID_ID,
        );
        Self {
            ids,
            next_id: RESERVED_SOURCE_IDS,
        }
    }

    /// Id for the source described by `fd`, assigning the next one if unseen.
    pub fn get_or_add(&mut self, fd: &FdInfo) -> u32 {
        self.get_or_add_source(IoSource::from_fd_info(fd))
    }

    pub fn get_or_add_source(&mut self, source: IoSource) -> u32 {
        let next_id = &mut self.next_id;
        *self.ids.entry(source).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            id
        })
    }

    /// Number of ids handed out, sentinels included.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Dense table where `table[id]` is the source assigned `id`.
    pub fn generate_reverse_lookup(&self) -> Vec<IoSource> {
        let mut entries: Vec<(&IoSource, u32)> =
            self.ids.iter().map(|(source, &id)| (source, id)).collect();
        entries.sort_unstable_by_key(|&(_, id)| id);
        entries
            .into_iter()
            .map(|(source, _)| source.clone())
            .collect()
    }
}
