//! Bucketing arithmetic and deterministic naming for series and chunks.
//!
//! Timestamps are validated as positive but otherwise unbounded, so every window edge is
//! computed with checked arithmetic: `None` means the window does not fit in an `i64`.

use crate::types::{DataType, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group code under which derived measures are stored and reported.
pub const MEASURES_GROUP: &str = "_MEASURES_";

/// Prefix of every backing collection name.
pub const COLLECTION_PREFIX: &str = "PulseChunks";

/// Identity of a stored series: the key metadata registration is idempotent on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub safe_path: String,
    pub data_type: DataType,
    pub sampling_rate: i64,
}

impl SeriesKey {
    pub fn new(path: &str, data_type: DataType, sampling_rate: i64) -> Self {
        SeriesKey {
            safe_path: safe_path(path),
            data_type,
            sampling_rate,
        }
    }

    /// Deterministic metadata id.
    pub fn id(&self) -> String {
        format!("{}_{}_{}", self.safe_path, self.data_type, self.sampling_rate)
    }

    /// Key of the chunk starting at `ts_start` in this series.
    pub fn chunk(&self, ts_start: Timestamp) -> ChunkKey {
        ChunkKey {
            series: self.clone(),
            ts_start,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Identity of one chunk: a series plus the start of its time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub series: SeriesKey,
    pub ts_start: Timestamp,
}

impl ChunkKey {
    /// Deterministic chunk id.
    pub fn id(&self) -> String {
        format!("{}_{}", self.series.id(), self.ts_start)
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
pub fn safe_path(path: &str) -> String {
    path.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Backing collection for a group, type and sampling rate.
pub fn collection_name(group_code: &str, data_type: DataType, sampling_rate: i64) -> String {
    format!("{}_{}_{}_{}", COLLECTION_PREFIX, group_code, data_type, sampling_rate)
}

/// Snaps a timestamp down onto the sampling grid.
#[inline]
pub fn normalize(ts: Timestamp, sampling_rate: i64) -> Timestamp {
    floor_to(ts, sampling_rate)
}

/// Width of one chunk in milliseconds, `None` if it overflows.
#[inline]
pub fn chunk_span(chunk_point_count: usize, sampling_rate: i64) -> Option<i64> {
    i64::try_from(chunk_point_count)
        .ok()?
        .checked_mul(sampling_rate)
}

/// Half-open `[ts_start, ts_end)` window of the chunk holding a normalized timestamp.
#[inline]
pub fn chunk_bounds(normalized_ts: Timestamp, span: i64) -> Option<(Timestamp, Timestamp)> {
    let ts_start = floor_to(normalized_ts, span);
    Some((ts_start, ts_start.checked_add(span)?))
}

/// Rounds down onto a multiple of `step`, saturating at `i64::MIN`.
#[inline]
pub fn floor_to(ts: Timestamp, step: i64) -> Timestamp {
    ts.saturating_sub(ts.rem_euclid(step))
}

/// Rounds up onto a multiple of `step`, saturating at `i64::MAX`.
#[inline]
pub fn ceil_to(ts: Timestamp, step: i64) -> Timestamp {
    let floor = floor_to(ts, step);
    if floor == ts {
        ts
    } else {
        floor.saturating_add(step)
    }
}
