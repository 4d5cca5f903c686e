//! WebSocket delivery.
//!
//! `/ws/stream` multiplexes up to `max_streams_per_connection`
//! subscriptions over one socket next to a small control vocabulary
//! (`subscribe`, `unsubscribe`, `ping`). `/ws/control` answers stats
//! queries. Each data connection runs one reader loop and one writer task;
//! subscriptions enqueue frames into the writer's bounded channel, and a
//! full channel disconnects the whole connection as a slow consumer.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::stream::{StreamEvent, StreamHandle, StreamLimits, StreamOwner, StreamRegistry};
use crate::types::{rfc3339_now, StreamMessage, TickType};
use crate::AppState;

pub async fn ws_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_data_socket(socket, state))
}

pub async fn ws_control(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_control_socket(socket, state))
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    #[serde(default)]
    timestamp: serde_json::Value,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscribeData {
    contract_id: serde_json::Value,
    #[serde(default)]
    tick_types: Vec<String>,
    #[serde(default)]
    config: SubscribeConfig,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeConfig {
    timeout_seconds: Option<u64>,
    limit: Option<u64>,
}

async fn handle_data_socket(socket: WebSocket, state: AppState) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    state.ws_connections.fetch_add(1, Ordering::Relaxed);
    info!(conn_id, "websocket data connection opened");

    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(state.config.server.buffer_size.max(1));
    let (closed_tx, mut closed_rx) = watch::channel(false);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connected = json!({
        "type": "connected",
        "timestamp": rfc3339_now(),
        "data": { "connection_id": conn_id },
    });
    let _ = out_tx.send(Message::Text(connected.to_string())).await;

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, conn_id, &text, &out_tx, &closed_tx).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = out_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id, error = %e, "websocket read error");
                    break;
                }
            },
            _ = closed_rx.changed() => {
                warn!(conn_id, "websocket connection closed as slow consumer");
                break;
            }
        }
    }

    // The client is gone: cancel every owned subscription with no
    // completion frame.
    for stream_id in state.registry.connection_stream_ids(conn_id) {
        state.registry.cancel(&stream_id, false);
    }
    drop(out_tx);
    let _ = writer.await;
    state.ws_connections.fetch_sub(1, Ordering::Relaxed);
    info!(conn_id, "websocket data connection closed");
}

async fn handle_client_text(
    state: &AppState,
    conn_id: u64,
    text: &str,
    out_tx: &mpsc::Sender<Message>,
    closed_tx: &watch::Sender<bool>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            send_error_frame(out_tx, None, None, &StreamError::new(
                crate::errors::ErrorCode::InvalidRequest,
                format!("unparseable message: {e}"),
                true,
            ))
            .await;
            return;
        }
    };

    match message.kind.as_str() {
        "subscribe" => handle_subscribe(state, conn_id, &message, out_tx, closed_tx).await,
        "unsubscribe" => {
            let stream_id = message
                .data
                .get("stream_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if stream_id.is_empty() {
                send_error_frame(out_tx, message.id.as_deref(), None, &StreamError::new(
                    crate::errors::ErrorCode::InvalidRequest,
                    "unsubscribe requires data.stream_id",
                    true,
                ))
                .await;
                return;
            }
            state.registry.cancel(stream_id, true);
        }
        "ping" => {
            let pong = json!({
                "type": "pong",
                "id": message.id,
                "timestamp": message.timestamp,
            });
            let _ = out_tx.send(Message::Text(pong.to_string())).await;
        }
        other => {
            send_error_frame(out_tx, message.id.as_deref(), None, &StreamError::new(
                crate::errors::ErrorCode::InvalidRequest,
                format!("unknown message type: {other}"),
                true,
            ))
            .await;
        }
    }
}

async fn handle_subscribe(
    state: &AppState,
    conn_id: u64,
    message: &ClientMessage,
    out_tx: &mpsc::Sender<Message>,
    closed_tx: &watch::Sender<bool>,
) {
    let data: SubscribeData = match serde_json::from_value(message.data.clone()) {
        Ok(data) => data,
        Err(e) => {
            send_error_frame(out_tx, message.id.as_deref(), None, &StreamError::new(
                crate::errors::ErrorCode::InvalidRequest,
                format!("invalid subscribe payload: {e}"),
                true,
            ))
            .await;
            return;
        }
    };

    let cid = data
        .contract_id
        .as_u64()
        .or_else(|| {
            data.contract_id
                .as_str()
                .and_then(|s| s.parse::<u64>().ok())
        })
        .and_then(|n| u32::try_from(n).ok());
    let Some(cid) = cid else {
        send_error_frame(out_tx, message.id.as_deref(), None, &StreamError::new(
            crate::errors::ErrorCode::InvalidRequest,
            "invalid contract_id",
            true,
        ))
        .await;
        return;
    };

    if data.tick_types.is_empty() {
        send_error_frame(
            out_tx,
            message.id.as_deref(),
            None,
            &StreamError::invalid_tick_type("(empty)"),
        )
        .await;
        return;
    }

    let mut tts: Vec<TickType> = Vec::with_capacity(data.tick_types.len());
    for raw in &data.tick_types {
        match raw.parse() {
            Ok(tt) => tts.push(tt),
            Err(e) => {
                send_error_frame(out_tx, message.id.as_deref(), None, &e).await;
                return;
            }
        }
    }

    let limits = StreamLimits {
        limit: data.config.limit,
        timeout: data.config.timeout_seconds.map(Duration::from_secs),
    };

    let mut handles: Vec<StreamHandle> = Vec::with_capacity(tts.len());
    for &tt in &tts {
        match state
            .registry
            .create(cid, tt, StreamOwner::WebSocket { conn_id }, limits)
        {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in handles {
                    state.registry.cancel(&handle.stream_id.to_string(), false);
                }
                send_error_frame(out_tx, message.id.as_deref(), None, &e).await;
                return;
            }
        }
    }

    let streams: Vec<serde_json::Value> = handles
        .iter()
        .map(|h| {
            json!({
                "stream_id": h.stream_id.to_string(),
                "contract_id": cid,
                "tick_type": h.stream_id.tt.as_str(),
            })
        })
        .collect();
    let subscribed = json!({
        "type": "subscribed",
        "id": message.id,
        "timestamp": rfc3339_now(),
        "data": { "streams": streams },
    });
    let _ = out_tx.send(Message::Text(subscribed.to_string())).await;

    for handle in handles {
        tokio::spawn(forward_ws_stream(
            state.registry.clone(),
            handle,
            out_tx.clone(),
            closed_tx.clone(),
        ));
    }
}

/// Pump one subscription into the connection's outbound channel. A full
/// channel means the socket cannot keep up; the whole connection is torn
/// down as a slow consumer.
async fn forward_ws_stream(
    registry: Arc<StreamRegistry>,
    handle: StreamHandle,
    out_tx: mpsc::Sender<Message>,
    closed_tx: watch::Sender<bool>,
) {
    let stream_id = handle.stream_id.to_string();
    let mut rx = handle.rx;

    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        let frame = ws_frame(&stream_id, &event);
        match out_tx.try_send(Message::Text(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = StreamError::slow_consumer();
                let frame = ws_frame(&stream_id, &StreamEvent::Error(err));
                let _ = out_tx.try_send(Message::Text(frame));
                let _ = closed_tx.send(true);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
        if terminal {
            break;
        }
    }

    if let Some(event) = registry.take_final(&stream_id) {
        let _ = out_tx.try_send(Message::Text(ws_frame(&stream_id, &event)));
    }
    registry.finish(&stream_id);
}

fn ws_frame(stream_id: &str, event: &StreamEvent) -> String {
    let message = match event {
        StreamEvent::Tick { msg, .. } => StreamMessage::tick(stream_id.to_string(), msg),
        StreamEvent::Info { status } => StreamMessage::info(Some(stream_id.to_string()), status),
        StreamEvent::Error(e) => StreamMessage::error(Some(stream_id.to_string()), e),
        StreamEvent::Complete(data) => StreamMessage::complete(stream_id.to_string(), data.clone()),
    };
    serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string())
}

async fn send_error_frame(
    out_tx: &mpsc::Sender<Message>,
    id: Option<&str>,
    stream_id: Option<&str>,
    err: &StreamError,
) {
    let frame = json!({
        "type": "error",
        "id": id,
        "stream_id": stream_id,
        "timestamp": rfc3339_now(),
        "data": {
            "code": err.code.as_str(),
            "message": err.message,
            "recoverable": err.recoverable,
        },
    });
    let _ = out_tx.send(Message::Text(frame.to_string())).await;
}

/// `/ws/control`: stats on request.
async fn handle_control_socket(mut socket: WebSocket, state: AppState) {
    while let Some(msg) = socket.recv().await {
        let Ok(msg) = msg else { break };
        match msg {
            Message::Text(text) => {
                let kind = serde_json::from_str::<ClientMessage>(&text)
                    .map(|m| m.kind)
                    .unwrap_or_default();
                let response = match kind.as_str() {
                    "get_stats" => json!({
                        "type": "stats",
                        "timestamp": rfc3339_now(),
                        "data": {
                            "connections": state.ws_connections.load(Ordering::Relaxed),
                            "subscriptions": state.registry.active_count(),
                            "streams": state.registry.stats_snapshot(),
                            "upstream": state.session.stats_snapshot(),
                            "storage": state.storage.stats(),
                        },
                    }),
                    "ping" => json!({
                        "type": "pong",
                        "timestamp": rfc3339_now(),
                    }),
                    other => json!({
                        "type": "error",
                        "timestamp": rfc3339_now(),
                        "data": {
                            "code": "INVALID_REQUEST",
                            "message": format!("unknown control message: {other}"),
                            "recoverable": true,
                        },
                    }),
                };
                if socket
                    .send(Message::Text(response.to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(payload) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}
