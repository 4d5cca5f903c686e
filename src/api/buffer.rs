//! Historical replay over the SSE envelope.
//!
//! Replays a bounded time range from the append store. The wire protocol
//! matches live streaming exactly, ending with
//! `complete(reason="complete")` once the last record has been sent.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::DateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::sse::parse_tick_types;
use crate::api::{error_response, status_for};
use crate::errors::{ErrorCode, StreamError};
use crate::storage::{Encoding, RangeQuery};
use crate::types::{
    now_micros, now_millis, CompleteData, CompleteReason, StreamId, StreamMessage, TickType,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct BufferParams {
    pub tick_types: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// Alternative to `start_time`: a lookback window such as `90s`, `15m`,
    /// `2h`, or `1d`, ending at `end_time` (default now).
    pub buffer_duration: Option<String>,
    pub format: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /buffer/{cid}/query`.
pub async fn buffer_query(
    Path(cid): Path<u32>,
    Query(params): Query<BufferParams>,
    State(state): State<AppState>,
) -> Response {
    let tts = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(tts) => tts,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let format: Encoding = match params.format.as_deref().unwrap_or("json").parse() {
        Ok(format) => format,
        Err(e) => return error_response(status_for(&e), &e),
    };
    let (start_micros, end_micros) = match resolve_range(&params) {
        Ok(range) => range,
        Err(e) => return error_response(status_for(&e), &e),
    };

    let query = RangeQuery {
        cid,
        tick_types: tts.clone(),
        start_micros,
        end_micros,
        limit: params.limit,
    };
    let records = match state.storage.query_range(query, format) {
        Ok(records) => records,
        Err(e) => return error_response(status_for(&e), &e),
    };

    replay_response(state, cid, tts, records).into_response()
}

/// Resolve `[t0, t1]` from explicit bounds or a lookback duration.
fn resolve_range(params: &BufferParams) -> Result<(u64, u64), StreamError> {
    let end_micros = match params.end_time.as_deref() {
        Some(raw) => parse_time(raw)?,
        None => now_micros(),
    };
    let start_micros = match (params.start_time.as_deref(), params.buffer_duration.as_deref()) {
        (Some(raw), _) => parse_time(raw)?,
        (None, Some(raw)) => {
            let duration = parse_duration(raw)?;
            end_micros.saturating_sub(duration.as_micros() as u64)
        }
        (None, None) => {
            return Err(StreamError::new(
                ErrorCode::InvalidRequest,
                "start_time or buffer_duration is required",
                false,
            ))
        }
    };
    if end_micros < start_micros {
        return Err(StreamError::new(
            ErrorCode::InvalidRequest,
            "end_time precedes start_time",
            false,
        ));
    }
    Ok((start_micros, end_micros))
}

/// Accepts RFC3339 or a numeric epoch (seconds are promoted to µs).
fn parse_time(raw: &str) -> Result<u64, StreamError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_micros().max(0) as u64);
    }
    if let Ok(mut n) = raw.parse::<u64>() {
        if n < 1_000_000_000_000 {
            n *= 1_000_000;
        }
        return Ok(n);
    }
    Err(StreamError::new(
        ErrorCode::InvalidRequest,
        format!("unparseable time: {raw:?}"),
        false,
    ))
}

fn parse_duration(raw: &str) -> Result<Duration, StreamError> {
    let raw = raw.trim();
    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = value.parse().map_err(|_| {
        StreamError::new(
            ErrorCode::InvalidRequest,
            format!("unparseable duration: {raw:?}"),
            false,
        )
    })?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => {
            return Err(StreamError::new(
                ErrorCode::InvalidRequest,
                format!("unknown duration unit: {unit:?}"),
                false,
            ))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// Stream stored records as `tick` events, then one `complete` per stream.
fn replay_response(
    state: AppState,
    cid: u32,
    tts: Vec<TickType>,
    mut records: mpsc::Receiver<crate::types::TickMessage>,
) -> Sse<impl futures_util::stream::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(state.config.server.buffer_size.max(1));

    tokio::spawn(async move {
        let opened_ms = now_millis();
        let stream_ids: HashMap<TickType, String> = tts
            .iter()
            .map(|&tt| (tt, StreamId::new(cid, tt, opened_ms, 0).to_string()))
            .collect();
        let mut seq: HashMap<TickType, u64> = HashMap::new();
        let mut counts: HashMap<TickType, u64> = HashMap::new();
        let started = std::time::Instant::now();

        while let Some(msg) = records.recv().await {
            let Some(stream_id) = stream_ids.get(&msg.tt) else {
                continue;
            };
            let n = seq.entry(msg.tt).or_insert(0);
            *n += 1;
            *counts.entry(msg.tt).or_insert(0) += 1;

            let message = StreamMessage::tick(stream_id.clone(), &msg);
            let event = Event::default()
                .event(message.message_type())
                .id(format!("{stream_id}-{n}"))
                .data(serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string()));
            if tx.send(event).await.is_err() {
                return;
            }
        }

        for &tt in &tts {
            let Some(stream_id) = stream_ids.get(&tt) else {
                continue;
            };
            let message = StreamMessage::complete(
                stream_id.clone(),
                CompleteData {
                    reason: CompleteReason::Complete,
                    total_ticks: counts.get(&tt).copied().unwrap_or(0),
                    duration_seconds: started.elapsed().as_secs_f64(),
                },
            );
            let n = seq.entry(tt).or_insert(0);
            *n += 1;
            let event = Event::default()
                .event("complete")
                .id(format!("{stream_id}-{n}"))
                .data(serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string()));
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    Sse::new(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(
            parse_time("2025-08-01T00:31:53Z").unwrap(),
            1754008313000000
        );
        assert_eq!(parse_time("1754008313").unwrap(), 1754008313000000);
        assert_eq!(parse_time("1754008313000000").unwrap(), 1754008313000000);
        assert!(parse_time("whenever").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("2w").is_err());
    }

    #[test]
    fn test_resolve_range_requires_a_start() {
        let params = BufferParams {
            tick_types: Some("bid_ask".to_string()),
            start_time: None,
            end_time: None,
            buffer_duration: None,
            format: None,
            limit: None,
        };
        assert!(resolve_range(&params).is_err());
    }

    #[test]
    fn test_resolve_range_from_duration() {
        let params = BufferParams {
            tick_types: Some("bid_ask".to_string()),
            start_time: None,
            end_time: Some("2025-08-01T02:00:00Z".to_string()),
            buffer_duration: Some("1h".to_string()),
            format: None,
            limit: None,
        };
        let (start, end) = resolve_range(&params).unwrap();
        assert_eq!(end - start, 3_600_000_000);
    }
}
