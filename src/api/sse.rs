//! Server-Sent Events delivery.
//!
//! One HTTP response carries one or more subscriptions; every event names
//! its `stream_id`. Framing per event: `event:` is the message type, `id:`
//! is `{stream_id}-{seq}`, `data:` is the single-line verbose envelope.
//! After a terminal `complete` or `error` the response closes. An idle
//! response emits an `info` heartbeat every 30 seconds so intermediaries
//! keep the connection open.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::{error_response, status_for};
use crate::errors::StreamError;
use crate::stream::{StreamEvent, StreamHandle, StreamLimits, StreamOwner, StreamRegistry};
use crate::types::{StreamMessage, TickType};
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub tick_types: Option<String>,
    pub limit: Option<u64>,
    /// Wall-clock bound in seconds.
    pub timeout: Option<u64>,
}

impl StreamParams {
    fn limits(&self) -> StreamLimits {
        StreamLimits {
            limit: self.limit,
            timeout: self.timeout.map(Duration::from_secs),
        }
    }
}

/// `GET /stream/{cid}/{tt}`: one subscription per response.
pub async fn stream_single(
    Path((cid, tt)): Path<(u32, String)>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let tt: TickType = match tt.parse() {
        Ok(tt) => tt,
        Err(e) => return error_response(status_for(&e), &e),
    };
    open_sse(&state, cid, vec![tt], params.limits())
}

/// `GET /stream/{cid}?tick_types=a,b`: several subscriptions multiplexed
/// over one response.
pub async fn stream_multi(
    Path(cid): Path<u32>,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let tts = match parse_tick_types(params.tick_types.as_deref()) {
        Ok(tts) => tts,
        Err(e) => return error_response(status_for(&e), &e),
    };
    open_sse(&state, cid, tts, params.limits())
}

/// Parse a comma-separated tick-type list; an empty list is rejected.
pub(crate) fn parse_tick_types(raw: Option<&str>) -> Result<Vec<TickType>, StreamError> {
    let raw = raw.unwrap_or("").trim();
    if raw.is_empty() {
        return Err(StreamError::invalid_tick_type("(empty)"));
    }
    raw.split(',')
        .map(|t| t.trim().parse::<TickType>())
        .collect()
}

fn open_sse(state: &AppState, cid: u32, tts: Vec<TickType>, limits: StreamLimits) -> Response {
    let mut handles = Vec::with_capacity(tts.len());
    for tt in tts {
        match state
            .registry
            .create(cid, tt, StreamOwner::Sse, limits)
        {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in handles {
                    state
                        .registry
                        .cancel(&handle.stream_id.to_string(), false);
                }
                return error_response(status_for(&e), &e);
            }
        }
    }
    sse_response(state, handles).into_response()
}

/// Merge the subscriptions' event channels into one SSE body.
pub(crate) fn sse_response(
    state: &AppState,
    handles: Vec<StreamHandle>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(state.config.server.buffer_size.max(1));
    for handle in handles {
        tokio::spawn(forward_stream(state.registry.clone(), handle, tx.clone()));
    }
    // The response ends when every forwarder has dropped its sender.
    drop(tx);

    Sse::new(futures_util::stream::unfold(rx, |mut rx| async move {
        match tokio::time::timeout(HEARTBEAT_INTERVAL, rx.recv()).await {
            Ok(Some(event)) => Some((Ok(event), rx)),
            Ok(None) => None,
            Err(_) => Some((Ok(heartbeat_event()), rx)),
        }
    }))
}

async fn forward_stream(
    registry: Arc<StreamRegistry>,
    handle: StreamHandle,
    tx: mpsc::Sender<Event>,
) {
    let stream_id = handle.stream_id.to_string();
    let mut rx = handle.rx;
    let mut seq: u64 = 0;
    let mut client_gone = false;

    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        seq += 1;
        if tx.send(to_sse_event(&stream_id, seq, &event)).await.is_err() {
            client_gone = true;
            break;
        }
        if terminal {
            break;
        }
    }

    if client_gone {
        // The HTTP response went away; no completion frame is owed.
        registry.cancel(&stream_id, false);
    } else if let Some(event) = registry.take_final(&stream_id) {
        seq += 1;
        let _ = tx.send(to_sse_event(&stream_id, seq, &event)).await;
    }
    registry.finish(&stream_id);
}

pub(crate) fn to_sse_event(stream_id: &str, seq: u64, event: &StreamEvent) -> Event {
    let message = match event {
        StreamEvent::Tick { msg, .. } => StreamMessage::tick(stream_id.to_string(), msg),
        StreamEvent::Info { status } => StreamMessage::info(Some(stream_id.to_string()), status),
        StreamEvent::Error(e) => StreamMessage::error(Some(stream_id.to_string()), e),
        StreamEvent::Complete(data) => StreamMessage::complete(stream_id.to_string(), data.clone()),
    };
    Event::default()
        .event(message.message_type())
        .id(format!("{stream_id}-{seq}"))
        .data(serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string()))
}

fn heartbeat_event() -> Event {
    let message = StreamMessage::info(None, "heartbeat");
    Event::default()
        .event("info")
        .data(serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tick_types() {
        assert_eq!(
            parse_tick_types(Some("bid_ask,last")).unwrap(),
            vec![TickType::BidAsk, TickType::Last]
        );
        assert!(parse_tick_types(Some("")).is_err());
        assert!(parse_tick_types(None).is_err());
        assert!(parse_tick_types(Some("bid_ask,bogus")).is_err());
    }
}
