//! Time-partitioned on-disk layout.
//!
//! Every record lands in exactly one partition keyed by
//! `(contract, tick type, UTC hour)`:
//!
//! ```text
//! <root>/<encoding>/<schema>/<cid>/<tt>/<YYYY>/<MM>/<DD>/<HH>/<cid>_<tt>_<HHMMSS>.<ext>
//! ```
//!
//! Partition hours are derived from broker event time, not system receive
//! time. Files are append-only and never rewritten.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use std::path::{Path, PathBuf};

use crate::types::TickType;

/// On-disk encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    Protobuf,
}

impl Encoding {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Protobuf => "protobuf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::Json => "jsonl",
            Encoding::Protobuf => "pb",
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = crate::errors::StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "protobuf" | "binary" => Ok(Encoding::Protobuf),
            other => Err(crate::errors::StreamError::new(
                crate::errors::ErrorCode::InvalidRequest,
                format!("unknown storage format: {other}"),
                false,
            )),
        }
    }
}

/// Schema versions. `V2` is the legacy verbose envelope, `V3` the compact
/// canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    V2,
    V3,
}

impl Schema {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Schema::V2 => "v2",
            Schema::V3 => "v3",
        }
    }
}

/// One (encoding, schema) pair; identifies a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendKind {
    pub encoding: Encoding,
    pub schema: Schema,
}

impl BackendKind {
    pub const JSON_V2: BackendKind = BackendKind {
        encoding: Encoding::Json,
        schema: Schema::V2,
    };
    pub const JSON_V3: BackendKind = BackendKind {
        encoding: Encoding::Json,
        schema: Schema::V3,
    };
    pub const PROTOBUF_V2: BackendKind = BackendKind {
        encoding: Encoding::Protobuf,
        schema: Schema::V2,
    };
    pub const PROTOBUF_V3: BackendKind = BackendKind {
        encoding: Encoding::Protobuf,
        schema: Schema::V3,
    };

    pub fn label(&self) -> String {
        format!("{}/{}", self.encoding.dir_name(), self.schema.dir_name())
    }

    /// Backend root below the storage root, e.g. `json/v3`.
    pub fn base_dir(&self, root: &Path) -> PathBuf {
        root.join(self.encoding.dir_name()).join(self.schema.dir_name())
    }
}

/// Partition key: contract, tick type, UTC hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub cid: u32,
    pub tt: TickType,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl PartitionKey {
    pub fn from_micros(cid: u32, tt: TickType, ts_micros: u64) -> Self {
        let dt = DateTime::<Utc>::from_timestamp_micros(ts_micros as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            cid,
            tt,
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
        }
    }

    /// Directory of this partition under a backend root.
    pub fn dir(&self, backend_root: &Path) -> PathBuf {
        backend_root
            .join(self.cid.to_string())
            .join(self.tt.as_str())
            .join(format!("{:04}", self.year))
            .join(format!("{:02}", self.month))
            .join(format!("{:02}", self.day))
            .join(format!("{:02}", self.hour))
    }

    /// File name for a file opened at `ts_micros`:
    /// `{cid}_{tt}_{HHMMSS}.{ext}`.
    pub fn file_name(&self, ts_micros: u64, extension: &str) -> String {
        let dt = DateTime::<Utc>::from_timestamp_micros(ts_micros as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        format!(
            "{}_{}_{:02}{:02}{:02}.{}",
            self.cid,
            self.tt.as_str(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            extension
        )
    }

    /// Inclusive start of this partition's hour, microseconds since epoch.
    pub fn hour_start_micros(&self) -> u64 {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, self.hour, 0, 0)
            .single()
            .map(|dt| dt.timestamp_micros().max(0) as u64)
            .unwrap_or(0)
    }
}

/// All partition keys for one (cid, tt) whose hours intersect
/// `[start_micros, end_micros]`, in ascending time order.
pub fn partitions_in_range(
    cid: u32,
    tt: TickType,
    start_micros: u64,
    end_micros: u64,
) -> Vec<PartitionKey> {
    if end_micros < start_micros {
        return Vec::new();
    }
    let mut keys = Vec::new();
    let mut cursor = DateTime::<Utc>::from_timestamp_micros(start_micros as i64)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let end = DateTime::<Utc>::from_timestamp_micros(end_micros as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    while cursor <= end {
        keys.push(PartitionKey {
            cid,
            tt,
            year: cursor.year(),
            month: cursor.month(),
            day: cursor.day(),
            hour: cursor.hour(),
        });
        cursor = cursor + chrono::Duration::hours(1);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-08-01T00:31:53Z in microseconds.
    const TS: u64 = 1754008313000000;

    #[test]
    fn test_partition_key_from_micros() {
        let key = PartitionKey::from_micros(711280073, TickType::BidAsk, TS);
        assert_eq!(key.year, 2025);
        assert_eq!(key.month, 8);
        assert_eq!(key.day, 1);
        assert_eq!(key.hour, 0);
    }

    #[test]
    fn test_partition_dir_layout() {
        let key = PartitionKey::from_micros(711280073, TickType::BidAsk, TS);
        let base = BackendKind::JSON_V3.base_dir(Path::new("storage"));
        let dir = key.dir(&base);
        assert_eq!(
            dir,
            PathBuf::from("storage/json/v3/711280073/bid_ask/2025/08/01/00")
        );
    }

    #[test]
    fn test_file_name_carries_open_time() {
        let key = PartitionKey::from_micros(711280073, TickType::BidAsk, TS);
        assert_eq!(
            key.file_name(TS, "jsonl"),
            "711280073_bid_ask_003153.jsonl"
        );
    }

    #[test]
    fn test_partitions_in_range_spans_hours() {
        let one_hour = 3_600_000_000u64;
        let keys = partitions_in_range(1, TickType::Last, TS, TS + 2 * one_hour);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].hour, 0);
        assert_eq!(keys[2].hour, 2);
    }

    #[test]
    fn test_partitions_in_range_empty_when_inverted() {
        assert!(partitions_in_range(1, TickType::Last, TS, TS - 1).is_empty());
    }

    #[test]
    fn test_hour_start() {
        let key = PartitionKey::from_micros(1, TickType::Last, TS);
        // 2025-08-01T00:00:00Z
        assert_eq!(key.hour_start_micros(), 1754006400000000);
    }
}
