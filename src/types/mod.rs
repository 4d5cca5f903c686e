//! Core data model: tick types, the compact tick record, stream identifiers
//! and the wire message envelope shared by SSE and WebSocket delivery.

mod convert;

pub use convert::{compact_to_verbose, ingest_verbose, verbose_payload, verbose_to_compact};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Tolerated gap between broker event time and system receive time before
/// the clock-skew counter fires.
pub const CLOCK_SKEW_TOLERANCE_US: u64 = 5_000_000;

/// Tick-by-tick subscription kinds supported by the upstream gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickType {
    BidAsk,
    Last,
    AllLast,
    MidPoint,
}

impl TickType {
    pub const ALL: [TickType; 4] = [
        TickType::BidAsk,
        TickType::Last,
        TickType::AllLast,
        TickType::MidPoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TickType::BidAsk => "bid_ask",
            TickType::Last => "last",
            TickType::AllLast => "all_last",
            TickType::MidPoint => "mid_point",
        }
    }

    /// Label the broker gateway expects on a tick-by-tick request.
    pub fn wire_label(&self) -> &'static str {
        match self {
            TickType::BidAsk => "BidAsk",
            TickType::Last => "Last",
            TickType::AllLast => "AllLast",
            TickType::MidPoint => "MidPoint",
        }
    }
}

impl FromStr for TickType {
    type Err = crate::errors::StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bid_ask" | "BidAsk" => Ok(TickType::BidAsk),
            "last" | "Last" => Ok(TickType::Last),
            "all_last" | "AllLast" => Ok(TickType::AllLast),
            "mid_point" | "MidPoint" => Ok(TickType::MidPoint),
            other => Err(crate::errors::StreamError::invalid_tick_type(other)),
        }
    }
}

impl std::fmt::Display for TickType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical compact tick record. This is the on-disk and in-process form;
/// field names match the wire contract exactly.
///
/// Optional fields are omitted from serialized output when absent, and
/// boolean attributes are only present when true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMessage {
    /// Broker event time, microseconds since epoch.
    pub ts: u64,
    /// System receive time, microseconds since epoch.
    pub st: u64,
    /// Contract identifier.
    pub cid: u32,
    /// Tick type tag.
    pub tt: TickType,
    /// Upstream request id that produced this tick. Preserved verbatim.
    pub rid: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ap: Option<f64>,
    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpl: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aph: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upt: Option<bool>,
}

impl TickMessage {
    /// Skeleton record with only the core fields set.
    pub fn new(ts: u64, st: u64, cid: u32, tt: TickType, rid: u32) -> Self {
        Self {
            ts,
            st,
            cid,
            tt,
            rid,
            p: None,
            s: None,
            bp: None,
            bs: None,
            ap: None,
            as_: None,
            mp: None,
            bpl: None,
            aph: None,
            upt: None,
        }
    }

    /// True when broker time runs ahead of system time beyond tolerance.
    pub fn violates_clock_skew(&self) -> bool {
        self.ts > self.st.saturating_add(CLOCK_SKEW_TOLERANCE_US)
    }
}

/// Identifier of one live subscription: `{cid}_{tt}_{unix_ms}_{rid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub cid: u32,
    pub tt: TickType,
    pub unix_ms: u64,
    pub rid: u32,
}

impl StreamId {
    pub fn new(cid: u32, tt: TickType, unix_ms: u64, rid: u32) -> Self {
        Self {
            cid,
            tt,
            unix_ms,
            rid,
        }
    }

    /// Parse a stream id back into its parts. The tick-type segment may
    /// itself contain underscores, so parsing anchors on both ends.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() < 4 {
            return None;
        }
        let cid = parts[0].parse().ok()?;
        let rid = parts[parts.len() - 1].parse().ok()?;
        let unix_ms = parts[parts.len() - 2].parse().ok()?;
        let tt = parts[1..parts.len() - 2].join("_").parse().ok()?;
        Some(Self {
            cid,
            tt,
            unix_ms,
            rid,
        })
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.cid,
            self.tt.as_str(),
            self.unix_ms,
            self.rid
        )
    }
}

/// Current time in microseconds since epoch.
pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Current time in milliseconds since epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// RFC3339 timestamp with microsecond precision and trailing `Z`.
pub fn rfc3339_micros(micros: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros as i64)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC3339 timestamp for "now".
pub fn rfc3339_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Terminal completion reasons carried on `complete` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteReason {
    LimitReached,
    Timeout,
    ClientGone,
    UpstreamLost,
    Shutdown,
    Complete,
}

impl CompleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompleteReason::LimitReached => "limit_reached",
            CompleteReason::Timeout => "timeout",
            CompleteReason::ClientGone => "client_gone",
            CompleteReason::UpstreamLost => "upstream_lost",
            CompleteReason::Shutdown => "shutdown",
            CompleteReason::Complete => "complete",
        }
    }
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&crate::errors::StreamError> for ErrorData {
    fn from(err: &crate::errors::StreamError) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            recoverable: err.recoverable,
        }
    }
}

/// Payload of a `complete` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteData {
    pub reason: CompleteReason,
    pub total_ticks: u64,
    pub duration_seconds: f64,
}

/// Verbose wire envelope shared by SSE and WebSocket delivery (and the
/// legacy on-disk schema, which adds `metadata`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Tick {
        stream_id: String,
        timestamp: String,
        data: serde_json::Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        timestamp: String,
        data: ErrorData,
    },
    Complete {
        stream_id: String,
        timestamp: String,
        data: CompleteData,
    },
    Info {
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        timestamp: String,
        data: serde_json::Value,
    },
}

impl StreamMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            StreamMessage::Tick { .. } => "tick",
            StreamMessage::Error { .. } => "error",
            StreamMessage::Complete { .. } => "complete",
            StreamMessage::Info { .. } => "info",
        }
    }

    pub fn tick(stream_id: String, msg: &TickMessage) -> Self {
        StreamMessage::Tick {
            stream_id,
            timestamp: rfc3339_micros(msg.st),
            data: verbose_payload(msg),
        }
    }

    pub fn error(stream_id: Option<String>, err: &crate::errors::StreamError) -> Self {
        StreamMessage::Error {
            stream_id,
            timestamp: rfc3339_now(),
            data: ErrorData::from(err),
        }
    }

    pub fn complete(stream_id: String, data: CompleteData) -> Self {
        StreamMessage::Complete {
            stream_id,
            timestamp: rfc3339_now(),
            data,
        }
    }

    pub fn info(stream_id: Option<String>, status: &str) -> Self {
        StreamMessage::Info {
            stream_id,
            timestamp: rfc3339_now(),
            data: serde_json::json!({ "status": status }),
        }
    }
}

/// Legacy verbose record as stored on disk by the v2 schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub stream_id: String,
    pub timestamp: String,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
}
