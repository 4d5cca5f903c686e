//! End-to-end streaming against a scripted gateway: subscribe through the
//! registry, receive ticks pumped by the fake broker, observe completion
//! and upstream request sharing.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tickstream_backend::config::ConnectionConfig;
use tickstream_backend::stream::{
    spawn_notice_listener, spawn_sweeper, RegistryLimits, StreamEvent, StreamLimits, StreamOwner,
    StreamRegistry,
};
use tickstream_backend::types::{CompleteReason, TickMessage, TickType};
use tickstream_backend::upstream::UpstreamSession;

/// Frame a gateway payload: 4-byte big-endian length + NUL-separated fields.
fn frame(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

async fn read_client_frame(socket: &mut TcpStream) -> Option<String> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.ok()?;
    let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    socket.read_exact(&mut payload).await.ok()?;
    Some(String::from_utf8_lossy(&payload).into_owned())
}

/// A minimal scripted gateway: answers the handshake, then pumps
/// `ticks_per_request` bid/ask ticks for every tick-by-tick subscribe it
/// receives.
async fn spawn_gateway(ticks_per_request: u64) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Handshake preamble: "API\0" + framed version range.
        let mut preamble = [0u8; 4];
        socket.read_exact(&mut preamble).await.unwrap();
        assert_eq!(&preamble, b"API\0");
        read_client_frame(&mut socket).await.unwrap();
        socket
            .write_all(&frame("176\020250801 00:31:53 UTC\0"))
            .await
            .unwrap();

        loop {
            let Some(payload) = read_client_frame(&mut socket).await else {
                break;
            };
            let fields: Vec<&str> = payload.split('\0').collect();
            if fields.first() == Some(&"97") {
                let rid: u32 = fields[1].parse().unwrap();
                // Give late joiners on the shared request time to register
                // before the burst.
                tokio::time::sleep(Duration::from_millis(250)).await;
                for i in 0..ticks_per_request {
                    let tick = format!(
                        "99\0{rid}\03\0{}\0{}\0{}\04\02\00\0",
                        1754008313 + i,
                        23260.0 + i as f64 * 0.25,
                        23260.5 + i as f64 * 0.25,
                    );
                    socket.write_all(&frame(&tick)).await.unwrap();
                }
            }
        }
    });

    port
}

fn connection_config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        client_id: 472,
        connection_timeout: Duration::from_secs(2),
        reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(50),
    }
}

struct Harness {
    registry: std::sync::Arc<StreamRegistry>,
    session: std::sync::Arc<UpstreamSession>,
    _shutdown_tx: tokio::sync::watch::Sender<bool>,
}

/// Wire session → registry with a pass-through pipeline (no storage).
async fn harness(port: u16) -> Harness {
    let (session, mut ticks) = UpstreamSession::spawn(connection_config(port));
    session.open().await.expect("gateway should accept");

    let registry = StreamRegistry::new(
        session.clone(),
        RegistryLimits {
            max_streams: 10,
            max_streams_per_connection: 4,
            buffer_size: 100,
        },
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_sweeper(registry.clone(), shutdown_rx.clone());
    spawn_notice_listener(registry.clone(), session.clone(), shutdown_rx);

    let publish_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(msg) = ticks.recv().await {
            publish_registry.publish(&msg);
        }
    });

    Harness {
        registry,
        session,
        _shutdown_tx: shutdown_tx,
    }
}

async fn recv_timeout(rx: &mut mpsc::Receiver<StreamEvent>) -> Option<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn subscribe_receives_ticks_then_limit_completion() {
    let port = spawn_gateway(5).await;
    let h = harness(port).await;

    let handle = h
        .registry
        .create(
            711280073,
            TickType::BidAsk,
            StreamOwner::Sse,
            StreamLimits {
                limit: Some(3),
                timeout: None,
            },
        )
        .unwrap();
    let mut rx = handle.rx;

    match recv_timeout(&mut rx).await {
        Some(StreamEvent::Info { status }) => assert_eq!(status, "subscribed"),
        other => panic!("expected subscribed info, got {other:?}"),
    }

    let mut ticks: Vec<TickMessage> = Vec::new();
    loop {
        match recv_timeout(&mut rx).await {
            Some(StreamEvent::Tick { msg, .. }) => ticks.push(msg),
            Some(StreamEvent::Complete(data)) => {
                assert_eq!(data.reason, CompleteReason::LimitReached);
                assert_eq!(data.total_ticks, 3);
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(ticks.len(), 3);
    // Broker order preserved, payload intact.
    assert_eq!(ticks[0].bp, Some(23260.0));
    assert_eq!(ticks[1].bp, Some(23260.25));
    assert_eq!(ticks[2].bp, Some(23260.5));
    assert!(ticks.windows(2).all(|p| p[0].ts <= p[1].ts));
    assert!(ticks.iter().all(|t| t.cid == 711280073 && t.rid != 0));

    // Channel closes after the terminal event.
    assert!(recv_timeout(&mut rx).await.is_none());
    let stream_id = handle.stream_id.to_string();
    h.registry.finish(&stream_id);
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test]
async fn two_subscribers_share_one_upstream_request() {
    let port = spawn_gateway(4).await;
    let h = harness(port).await;

    let a = h
        .registry
        .create(
            711280073,
            TickType::BidAsk,
            StreamOwner::Sse,
            StreamLimits::default(),
        )
        .unwrap();
    let b = h
        .registry
        .create(
            711280073,
            TickType::BidAsk,
            StreamOwner::WebSocket { conn_id: 1 },
            StreamLimits::default(),
        )
        .unwrap();

    // One upstream request outstanding, shared by both streams, and both
    // stream ids carry the same rid.
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 1);
    assert_eq!(a.stream_id.rid, b.stream_id.rid);
    assert_ne!(a.stream_id.to_string(), b.stream_id.to_string());

    // Both subscribers see the burst in order.
    let mut rx_a = a.rx;
    let mut rx_b = b.rx;
    let mut count_a = 0;
    let mut count_b = 0;
    for _ in 0..8 {
        match recv_timeout(&mut rx_a).await {
            Some(StreamEvent::Tick { .. }) => count_a += 1,
            Some(StreamEvent::Info { .. }) => {}
            other => panic!("unexpected event for a: {other:?}"),
        }
        if count_a == 4 {
            break;
        }
    }
    for _ in 0..8 {
        match recv_timeout(&mut rx_b).await {
            Some(StreamEvent::Tick { .. }) => count_b += 1,
            Some(StreamEvent::Info { .. }) => {}
            other => panic!("unexpected event for b: {other:?}"),
        }
        if count_b == 4 {
            break;
        }
    }
    assert_eq!(count_a, 4);
    assert_eq!(count_b, 4);

    // First cancel keeps the shared request; the second releases it.
    h.registry.cancel(&a.stream_id.to_string(), false);
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 1);
    h.registry.cancel(&b.stream_id.to_string(), false);
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 0);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let port = spawn_gateway(0).await;
    let h = harness(port).await;

    let handle = h
        .registry
        .create(
            711280073,
            TickType::Last,
            StreamOwner::Sse,
            StreamLimits::default(),
        )
        .unwrap();
    let stream_id = handle.stream_id.to_string();

    h.registry.cancel(&stream_id, false);
    let after_first = h.session.stats_snapshot().outstanding_requests;
    h.registry.cancel(&stream_id, false);
    let after_second = h.session.stats_snapshot().outstanding_requests;

    assert_eq!(after_first, 0);
    assert_eq!(after_second, 0);
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test]
async fn timeout_produces_complete_event() {
    let port = spawn_gateway(0).await;
    let h = harness(port).await;

    let handle = h
        .registry
        .create(
            711280073,
            TickType::MidPoint,
            StreamOwner::Sse,
            StreamLimits {
                limit: None,
                timeout: Some(Duration::from_millis(300)),
            },
        )
        .unwrap();
    let mut rx = handle.rx;

    match recv_timeout(&mut rx).await {
        Some(StreamEvent::Info { status }) => assert_eq!(status, "subscribed"),
        other => panic!("expected subscribed info, got {other:?}"),
    }
    match recv_timeout(&mut rx).await {
        Some(StreamEvent::Complete(data)) => {
            assert_eq!(data.reason, CompleteReason::Timeout);
            assert_eq!(data.total_ticks, 0);
        }
        other => panic!("expected timeout completion, got {other:?}"),
    }
    // The sweeper releases the upstream reference right after delivering
    // the completion.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 0);
}

#[tokio::test]
async fn slow_consumer_is_disconnected_with_error() {
    let port = spawn_gateway(0).await;
    let h = harness(port).await;

    let handle = h
        .registry
        .create(
            711280073,
            TickType::BidAsk,
            StreamOwner::Sse,
            StreamLimits::default(),
        )
        .unwrap();
    let stream_id = handle.stream_id.to_string();
    let mut rx = handle.rx;

    // Flood without draining: the queue (capacity 100) holds the
    // subscribed info plus 99 ticks before overflowing.
    let mut msg = TickMessage::new(1754008313000000, 1754008313000037, 711280073, TickType::BidAsk, handle.stream_id.rid);
    msg.bp = Some(23260.0);
    msg.bs = Some(4.0);
    msg.ap = Some(23260.5);
    msg.as_ = Some(2.0);
    for i in 0..150u64 {
        let mut tick = msg.clone();
        tick.ts += i * 1000;
        h.registry.publish(&tick);
    }

    assert_eq!(h.registry.stats_snapshot().slow_consumer_disconnects, 1);

    // Drain: info, 99 ticks, then the channel closes; the terminal error
    // is parked for the delivery layer.
    let mut delivered = 0;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Tick { .. } => delivered += 1,
            StreamEvent::Info { .. } => {}
            other => panic!("unexpected in-band event: {other:?}"),
        }
    }
    assert_eq!(delivered, 99);

    match h.registry.take_final(&stream_id) {
        Some(StreamEvent::Error(err)) => {
            assert_eq!(err.code, tickstream_backend::errors::ErrorCode::SlowConsumer);
            assert!(!err.recoverable);
        }
        other => panic!("expected parked slow-consumer error, got {other:?}"),
    }
    h.registry.finish(&stream_id);
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 0);
}

/// Gateway that drops the first connection after a burst, then serves a
/// second connection and pumps again on the replayed subscription.
async fn spawn_flaky_gateway() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        for round in 0..2u32 {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut preamble = [0u8; 4];
            socket.read_exact(&mut preamble).await.unwrap();
            read_client_frame(&mut socket).await.unwrap();
            socket
                .write_all(&frame("176\020250801 00:31:53 UTC\0"))
                .await
                .unwrap();

            loop {
                let Some(payload) = read_client_frame(&mut socket).await else {
                    break;
                };
                let fields: Vec<&str> = payload.split('\0').collect();
                if fields.first() == Some(&"97") {
                    let rid: u32 = fields[1].parse().unwrap();
                    for i in 0..2u64 {
                        let tick = format!(
                            "99\0{rid}\03\0{}\023260.0\023260.5\04\02\00\0",
                            1754008313 + u64::from(round) * 10 + i,
                        );
                        socket.write_all(&frame(&tick)).await.unwrap();
                    }
                    if round == 0 {
                        // Simulate gateway failure after the first burst.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        drop(socket);
                        break;
                    }
                }
            }
        }
    });

    port
}

#[tokio::test]
async fn reconnect_replays_subscription_with_fresh_rid() {
    let port = spawn_flaky_gateway().await;
    let h = harness(port).await;

    let handle = h
        .registry
        .create(
            711280073,
            TickType::BidAsk,
            StreamOwner::Sse,
            StreamLimits::default(),
        )
        .unwrap();
    let original_rid = handle.stream_id.rid;
    let mut rx = handle.rx;

    let mut ticks: Vec<TickMessage> = Vec::new();
    let mut statuses: Vec<String> = Vec::new();
    while ticks.len() < 4 {
        match recv_timeout(&mut rx).await {
            Some(StreamEvent::Tick { msg, .. }) => ticks.push(msg),
            Some(StreamEvent::Info { status }) => statuses.push(status),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // The subscription survived the drop: same stream, fresh rid, ticks on
    // both sides of the gap, and the client was told about the recovery.
    assert_eq!(statuses.first().map(String::as_str), Some("subscribed"));
    assert!(statuses.iter().any(|s| s == "reconnecting"));
    assert!(statuses.iter().any(|s| s == "resubscribed"));
    assert_eq!(ticks[0].rid, original_rid);
    assert_ne!(ticks[3].rid, original_rid);
    assert_eq!(h.session.stats_snapshot().reconnects, 1);
    assert_eq!(h.session.stats_snapshot().outstanding_requests, 1);
}

#[tokio::test]
async fn process_cap_rejects_excess_streams() {
    let port = spawn_gateway(0).await;
    let h = harness(port).await;

    // Fill the per-connection cap for one socket.
    for tt in [
        TickType::BidAsk,
        TickType::Last,
        TickType::AllLast,
        TickType::MidPoint,
    ] {
        h.registry
            .create(1, tt, StreamOwner::WebSocket { conn_id: 9 }, StreamLimits::default())
            .unwrap();
    }
    let err = h
        .registry
        .create(
            2,
            TickType::Last,
            StreamOwner::WebSocket { conn_id: 9 },
            StreamLimits::default(),
        )
        .expect_err("per-connection cap must reject");
    assert_eq!(
        err.code,
        tickstream_backend::errors::ErrorCode::StreamLimitReached
    );

    // A different connection is unaffected.
    h.registry
        .create(
            2,
            TickType::Last,
            StreamOwner::WebSocket { conn_id: 10 },
            StreamLimits::default(),
        )
        .unwrap();
}
