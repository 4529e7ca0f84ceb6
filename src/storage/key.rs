//! Deterministic storage keys for window artifacts.
//!
//! Layout:
//! `{prefix}/v{version:04}/x{hex(app)}/x{hex(cluster)}/x{hex(proc)}/{start}/{duration}/{work_type}`
//! where `start` is RFC 3339 in UTC with second precision. The `x` sigil keeps
//! identity segments non-empty when a field is empty. Summary keys end
//! in `summary` instead of the work type.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::aggregation::window::{ProcessGroup, WindowId, WorkType};

/// Artifact layout version written into every key and artifact header.
pub const SCHEMA_VERSION: u32 = 1;

const SUMMARY_SEGMENT: &str = "summary";

const IDENTITY_SIGIL: char = 'x';

/// Segments following the prefix.
const KEY_SEGMENTS: usize = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("too few segments in storage key {key:?}")]
    TooFewSegments { key: String },

    #[error("invalid version segment {segment:?}")]
    InvalidVersion { segment: String },

    #[error("invalid hex segment {segment:?}")]
    InvalidHex { segment: String },

    #[error("invalid start timestamp {segment:?}")]
    InvalidStart { segment: String },

    #[error("invalid duration {segment:?}")]
    InvalidDuration { segment: String },

    #[error("unknown work type {segment:?}")]
    UnknownWorkType { segment: String },
}

/// Fields shared by window and summary keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketRef {
    pub prefix: String,
    pub version: u32,
    pub group: ProcessGroup,
    pub start: DateTime<Utc>,
    pub duration_secs: u32,
}

impl BucketRef {
    fn render(&self, last: &str) -> String {
        let body = format!(
            "v{:04}/{}/{}/{}/{}/{}/{}",
            self.version,
            encode_identity(&self.group.app_id),
            encode_identity(&self.group.cluster_id),
            encode_identity(&self.group.proc_name),
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.duration_secs,
            last,
        );
        if self.prefix.is_empty() {
            body
        } else {
            format!("{}/{}", self.prefix, body)
        }
    }

    /// Split `key` into the bucket reference and the final segment.
    fn parse(key: &str) -> Result<(Self, &str), KeyError> {
        let mut parts: Vec<&str> = key.rsplitn(KEY_SEGMENTS + 1, '/').collect();
        if parts.len() < KEY_SEGMENTS {
            return Err(KeyError::TooFewSegments {
                key: key.to_string(),
            });
        }
        let prefix = if parts.len() > KEY_SEGMENTS {
            parts.pop().unwrap_or_default()
        } else {
            ""
        };
        parts.reverse();
        let [version, app, cluster, proc_name, start, duration, last] = parts[..] else {
            return Err(KeyError::TooFewSegments {
                key: key.to_string(),
            });
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| KeyError::InvalidVersion {
                segment: version.to_string(),
            })?;
        let start = DateTime::parse_from_rfc3339(start)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| KeyError::InvalidStart {
                segment: start.to_string(),
            })?;
        let duration_secs = duration
            .parse::<u32>()
            .map_err(|_| KeyError::InvalidDuration {
                segment: duration.to_string(),
            })?;

        let bucket = Self {
            prefix: prefix.to_string(),
            version,
            group: ProcessGroup {
                app_id: decode_hex(app)?,
                cluster_id: decode_hex(cluster)?,
                proc_name: decode_hex(proc_name)?,
            },
            start,
            duration_secs,
        };
        Ok((bucket, last))
    }
}

fn encode_identity(value: &str) -> String {
    format!("{IDENTITY_SIGIL}{}", hex::encode(value))
}

fn decode_hex(segment: &str) -> Result<String, KeyError> {
    segment
        .strip_prefix(IDENTITY_SIGIL)
        .and_then(|hex_part| hex::decode(hex_part).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or_else(|| KeyError::InvalidHex {
            segment: segment.to_string(),
        })
}

/// Key of a full window artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub bucket: BucketRef,
    pub work_type: WorkType,
}

impl StorageKey {
    /// Key for `id` at the current schema version.
    pub fn for_window(prefix: &str, id: &WindowId) -> Self {
        Self {
            bucket: BucketRef {
                prefix: prefix.to_string(),
                version: SCHEMA_VERSION,
                group: id.group.clone(),
                start: id.start,
                duration_secs: id.duration_secs,
            },
            work_type: id.work_type,
        }
    }

    pub fn summary(&self) -> SummaryKey {
        SummaryKey {
            bucket: self.bucket.clone(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let (bucket, last) = BucketRef::parse(key)?;
        let work_type = WorkType::from_name(last).ok_or_else(|| KeyError::UnknownWorkType {
            segment: last.to_string(),
        })?;
        Ok(Self { bucket, work_type })
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket.render(self.work_type.as_str()))
    }
}

/// Key of the per-bucket summary artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SummaryKey {
    pub bucket: BucketRef,
}

impl SummaryKey {
    pub fn for_window(prefix: &str, id: &WindowId) -> Self {
        StorageKey::for_window(prefix, id).summary()
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let (bucket, last) = BucketRef::parse(key)?;
        if last != SUMMARY_SEGMENT {
            return Err(KeyError::UnknownWorkType {
                segment: last.to_string(),
            });
        }
        Ok(Self { bucket })
    }
}

impl fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bucket.render(SUMMARY_SEGMENT))
    }
}
