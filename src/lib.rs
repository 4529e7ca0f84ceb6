//! Ingestion and aggregation core for a distributed profiler.
//!
//! Agents stream checksummed recording chunks over TCP ([`ingest`]). Each
//! chunk is folded into time-bucketed aggregation windows per process group
//! ([`aggregation`]), and finalized windows are written as versioned
//! artifacts with a per-bucket summary ([`storage`]).

pub mod aggregation;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod leader;
pub mod service;
pub mod storage;
