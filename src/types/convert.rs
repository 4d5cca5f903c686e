//! Conversions between the legacy verbose schema and the compact canonical
//! form.
//!
//! The verbose→compact direction is the back-compat ingest path and must
//! preserve the broker request id from `metadata.request_id` verbatim.
//! Field omission rules: absent numerics stay absent, false booleans are
//! dropped entirely.

use serde_json::{json, Map, Value};

use crate::errors::{ErrorCode, StreamError};
use crate::types::{now_micros, rfc3339_micros, TickMessage, TickType, VerboseRecord};

/// Timestamps below this are treated as seconds and promoted to microseconds.
const MICROS_THRESHOLD: u64 = 1_000_000_000_000;

fn value_u64(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn value_u32(v: &Value) -> Option<u32> {
    value_u64(v).and_then(|n| u32::try_from(n).ok())
}

fn value_f64(v: &Value) -> Option<f64> {
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn field_f64(map: &Value, key: &str) -> Option<f64> {
    map.get(key).and_then(value_f64)
}

fn field_true(map: &Value, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Convert a legacy verbose record into the compact canonical form.
///
/// `st` is the system receive time to stamp; pass `now_micros()` on a live
/// ingest path, or a recorded value when replaying.
pub fn verbose_to_compact(record: &VerboseRecord, st: u64) -> Result<TickMessage, StreamError> {
    let metadata = &record.metadata;
    let data = &record.data;

    let cid = metadata
        .get("contract_id")
        .and_then(value_u32)
        .ok_or_else(|| {
            StreamError::new(
                ErrorCode::InvalidRequest,
                "missing contract_id in metadata",
                false,
            )
        })?;

    let tt: TickType = metadata
        .get("tick_type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            StreamError::new(ErrorCode::InvalidTickType, "missing tick_type in metadata", false)
        })?
        .parse()?;

    // The broker request id is canonical. Synthesizing one here would break
    // correlation with the upstream session.
    let rid = metadata
        .get("request_id")
        .and_then(value_u32)
        .ok_or_else(|| {
            StreamError::new(
                ErrorCode::InvalidRequest,
                "missing request_id in metadata",
                false,
            )
        })?;

    let mut ts = data.get("unix_time").and_then(value_u64).unwrap_or(st);
    if ts < MICROS_THRESHOLD {
        ts *= 1_000_000;
    }

    let mut msg = TickMessage::new(ts, st, cid, tt, rid);
    match tt {
        TickType::BidAsk => {
            msg.bp = field_f64(data, "bid_price");
            msg.bs = field_f64(data, "bid_size");
            msg.ap = field_f64(data, "ask_price");
            msg.as_ = field_f64(data, "ask_size");
            if field_true(data, "bid_past_low") {
                msg.bpl = Some(true);
            }
            if field_true(data, "ask_past_high") {
                msg.aph = Some(true);
            }
        }
        TickType::Last | TickType::AllLast => {
            msg.p = field_f64(data, "price");
            msg.s = field_f64(data, "size");
            if field_true(data, "unreported") {
                msg.upt = Some(true);
            }
        }
        TickType::MidPoint => {
            msg.mp = field_f64(data, "mid_point");
        }
    }

    Ok(msg)
}

/// Variant payload with long field names, as delivered on the wire.
pub fn verbose_payload(msg: &TickMessage) -> Value {
    let mut data = Map::new();
    data.insert("contract_id".into(), json!(msg.cid));
    data.insert("tick_type".into(), json!(msg.tt.as_str()));
    data.insert("unix_time".into(), json!(msg.ts));

    match msg.tt {
        TickType::BidAsk => {
            if let Some(v) = msg.bp {
                data.insert("bid_price".into(), json!(v));
            }
            if let Some(v) = msg.bs {
                data.insert("bid_size".into(), json!(v));
            }
            if let Some(v) = msg.ap {
                data.insert("ask_price".into(), json!(v));
            }
            if let Some(v) = msg.as_ {
                data.insert("ask_size".into(), json!(v));
            }
            if msg.bpl == Some(true) {
                data.insert("bid_past_low".into(), json!(true));
            }
            if msg.aph == Some(true) {
                data.insert("ask_past_high".into(), json!(true));
            }
        }
        TickType::Last | TickType::AllLast => {
            if let Some(v) = msg.p {
                data.insert("price".into(), json!(v));
            }
            if let Some(v) = msg.s {
                data.insert("size".into(), json!(v));
            }
            if msg.upt == Some(true) {
                data.insert("unreported".into(), json!(true));
            }
        }
        TickType::MidPoint => {
            if let Some(v) = msg.mp {
                data.insert("mid_point".into(), json!(v));
            }
        }
    }

    Value::Object(data)
}

/// Convert a compact record back into the legacy verbose envelope.
pub fn compact_to_verbose(msg: &TickMessage) -> VerboseRecord {
    let stream_id = format!(
        "{}_{}_{}_{}",
        msg.cid,
        msg.tt.as_str(),
        msg.ts / 1_000,
        msg.rid
    );

    VerboseRecord {
        kind: "tick".to_string(),
        stream_id,
        timestamp: rfc3339_micros(msg.st),
        data: verbose_payload(msg),
        metadata: json!({
            "contract_id": msg.cid.to_string(),
            "tick_type": msg.tt.as_str(),
            "request_id": msg.rid.to_string(),
            "source": "stream_manager",
        }),
    }
}

/// Convenience for the live ingest path: verbose in, compact out, stamped now.
pub fn ingest_verbose(record: &VerboseRecord) -> Result<TickMessage, StreamError> {
    verbose_to_compact(record, now_micros())
}
