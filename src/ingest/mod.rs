//! Agent-facing ingest: framing, decoding and per-connection sessions.

pub mod cursor;
pub mod parse;
pub mod server;
pub mod session;
pub mod wire;
