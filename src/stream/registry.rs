//! Subscription registry and fan-out.
//!
//! Owns the `stream_id → subscription` map, enforces the process-wide and
//! per-connection caps, and fans one upstream tick out to every interested
//! subscriber over bounded channels. The publish path never blocks: a full
//! subscriber queue triggers that subscriber's overflow policy
//! (disconnect with `SLOW_CONSUMER`) and nothing else.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCode, StreamError};
use crate::types::{
    now_millis, CompleteData, CompleteReason, StreamId, TickMessage, TickType,
};
use crate::upstream::{SessionNotice, UpstreamSession};

/// Events delivered to one subscriber, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick { seq: u64, msg: TickMessage },
    Info { status: String },
    Error(StreamError),
    Complete(CompleteData),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::Complete(_))
    }
}

/// Who owns a subscription; drives the per-connection cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOwner {
    Sse,
    WebSocket { conn_id: u64 },
    Tracker,
}

/// Optional per-subscription bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamLimits {
    /// Maximum ticks before `complete(limit_reached)`.
    pub limit: Option<u64>,
    /// Wall-clock bound before `complete(timeout)`.
    pub timeout: Option<Duration>,
}

/// Handle returned to the delivery layer.
#[derive(Debug)]
pub struct StreamHandle {
    pub stream_id: StreamId,
    pub rx: mpsc::Receiver<StreamEvent>,
}

/// Registry caps, snapshotted from configuration.
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_streams: usize,
    pub max_streams_per_connection: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub streams_created: AtomicU64,
    pub streams_completed: AtomicU64,
    pub slow_consumer_disconnects: AtomicU64,
    pub ticks_published: AtomicU64,
    pub clock_skew_violations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatsSnapshot {
    pub active_streams: usize,
    pub streams_created: u64,
    pub streams_completed: u64,
    pub slow_consumer_disconnects: u64,
    pub ticks_published: u64,
    pub clock_skew_violations: u64,
}

struct SubEntry {
    cid: u32,
    tt: TickType,
    rid: u32,
    owner: StreamOwner,
    tx: Option<mpsc::Sender<StreamEvent>>,
    limit: Option<u64>,
    deadline: Option<Instant>,
    created_at: Instant,
    ticks_delivered: u64,
    seq: u64,
    /// Terminal event that could not be delivered in-band.
    pending_final: Option<StreamEvent>,
    terminal: bool,
    upstream_released: bool,
}

impl SubEntry {
    fn complete_data(&self, reason: CompleteReason) -> CompleteData {
        CompleteData {
            reason,
            total_ticks: self.ticks_delivered,
            duration_seconds: self.created_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, SubEntry>,
    /// (cid, tt) → stream ids, in creation order.
    index: HashMap<(u32, TickType), Vec<String>>,
}

impl RegistryInner {
    fn insert(&mut self, stream_id: String, entry: SubEntry) {
        self.index
            .entry((entry.cid, entry.tt))
            .or_default()
            .push(stream_id.clone());
        self.entries.insert(stream_id, entry);
    }

    fn detach(&mut self, stream_id: &str) -> Option<SubEntry> {
        let entry = self.entries.remove(stream_id)?;
        if let Some(ids) = self.index.get_mut(&(entry.cid, entry.tt)) {
            ids.retain(|id| id != stream_id);
            if ids.is_empty() {
                self.index.remove(&(entry.cid, entry.tt));
            }
        }
        Some(entry)
    }
}

/// Shared subscription registry.
pub struct StreamRegistry {
    inner: Mutex<RegistryInner>,
    session: Arc<UpstreamSession>,
    limits: RegistryLimits,
    stats: RegistryStats,
    /// Millisecond component of the last issued stream id. Subscriptions
    /// sharing one upstream rid must still get distinct stream ids.
    last_stream_ms: AtomicU64,
}

impl StreamRegistry {
    pub fn new(session: Arc<UpstreamSession>, limits: RegistryLimits) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            session,
            limits,
            stats: RegistryStats::default(),
            last_stream_ms: AtomicU64::new(0),
        })
    }

    /// Strictly increasing millisecond stamp for stream ids.
    fn next_stream_ms(&self) -> u64 {
        let now = now_millis();
        self.last_stream_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now)
    }

    /// Create one subscription. `limit == 0` or `timeout == 0` complete
    /// immediately without touching the upstream session.
    pub fn create(
        &self,
        cid: u32,
        tt: TickType,
        owner: StreamOwner,
        limits: StreamLimits,
    ) -> Result<StreamHandle, StreamError> {
        if let Some(reason) = immediate_reason(&limits) {
            let (tx, rx) = mpsc::channel(2);
            let _ = tx.try_send(StreamEvent::Complete(CompleteData {
                reason,
                total_ticks: 0,
                duration_seconds: 0.0,
            }));
            self.stats.streams_created.fetch_add(1, Ordering::Relaxed);
            self.stats.streams_completed.fetch_add(1, Ordering::Relaxed);
            return Ok(StreamHandle {
                stream_id: StreamId::new(cid, tt, now_millis(), 0),
                rx,
            });
        }

        {
            let inner = self.inner.lock();
            if inner.entries.len() >= self.limits.max_streams {
                return Err(StreamError::stream_limit(format!(
                    "process stream cap reached ({})",
                    self.limits.max_streams
                )));
            }
            if let StreamOwner::WebSocket { conn_id } = owner {
                let connection_streams = inner
                    .entries
                    .values()
                    .filter(|e| e.owner == StreamOwner::WebSocket { conn_id })
                    .count();
                if connection_streams >= self.limits.max_streams_per_connection {
                    return Err(StreamError::stream_limit(format!(
                        "per-connection stream cap reached ({})",
                        self.limits.max_streams_per_connection
                    )));
                }
            }
        }

        let rid = self.session.subscribe(cid, tt)?;
        let stream_id = StreamId::new(cid, tt, self.next_stream_ms(), rid);
        let (tx, rx) = mpsc::channel(self.limits.buffer_size.max(1));

        let _ = tx.try_send(StreamEvent::Info {
            status: "subscribed".to_string(),
        });

        let entry = SubEntry {
            cid,
            tt,
            rid,
            owner,
            tx: Some(tx),
            limit: limits.limit,
            deadline: limits.timeout.map(|t| Instant::now() + t),
            created_at: Instant::now(),
            ticks_delivered: 0,
            seq: 0,
            pending_final: None,
            terminal: false,
            upstream_released: false,
        };

        self.inner.lock().insert(stream_id.to_string(), entry);
        self.stats.streams_created.fetch_add(1, Ordering::Relaxed);
        info!(stream_id = %stream_id, cid, tt = %tt, "stream created");

        Ok(StreamHandle { stream_id, rx })
    }

    /// Fan one tick out to every subscription with a matching (cid, tt).
    pub fn publish(&self, msg: &TickMessage) {
        self.stats.ticks_published.fetch_add(1, Ordering::Relaxed);
        if msg.violates_clock_skew() {
            self.stats
                .clock_skew_violations
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut released: Vec<u32> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(ids) = inner.index.get(&(msg.cid, msg.tt)).cloned() else {
                return;
            };

            for id in ids {
                let Some(entry) = inner.entries.get_mut(&id) else {
                    continue;
                };
                if entry.terminal {
                    continue;
                }

                entry.seq += 1;
                let event = StreamEvent::Tick {
                    seq: entry.seq,
                    msg: msg.clone(),
                };

                let Some(tx) = entry.tx.as_ref() else {
                    continue;
                };
                match tx.try_send(event) {
                    Ok(()) => {
                        entry.ticks_delivered += 1;
                        if entry.limit == Some(entry.ticks_delivered) {
                            let data = entry.complete_data(CompleteReason::LimitReached);
                            finish(entry, StreamEvent::Complete(data), &mut released);
                            self.stats.streams_completed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(stream_id = %id, "subscriber queue overflow; disconnecting");
                        finish(
                            entry,
                            StreamEvent::Error(StreamError::slow_consumer()),
                            &mut released,
                        );
                        self.stats
                            .slow_consumer_disconnects
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        // Receiver is gone without an explicit cancel.
                        let data = entry.complete_data(CompleteReason::ClientGone);
                        finish(entry, StreamEvent::Complete(data), &mut released);
                    }
                }
            }
        }
        self.release_rids(&released);
    }

    /// Deliver an informational status to every live subscription.
    pub fn broadcast_info(&self, status: &str) {
        let inner = self.inner.lock();
        for entry in inner.entries.values() {
            if entry.terminal {
                continue;
            }
            if let Some(tx) = entry.tx.as_ref() {
                let _ = tx.try_send(StreamEvent::Info {
                    status: status.to_string(),
                });
            }
        }
    }

    /// Cancel a subscription. `notify` controls whether a final
    /// `complete(client_gone)` is delivered (false when the client already
    /// went away). Idempotent.
    pub fn cancel(&self, stream_id: &str, notify: bool) {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(stream_id) else {
                return;
            };
            if !entry.terminal {
                let event = StreamEvent::Complete(entry.complete_data(CompleteReason::ClientGone));
                if notify {
                    finish(entry, event, &mut released);
                } else {
                    entry.terminal = true;
                    entry.tx = None;
                    if !entry.upstream_released {
                        entry.upstream_released = true;
                        released.push(entry.rid);
                    }
                }
                self.stats.streams_completed.fetch_add(1, Ordering::Relaxed);
            }
            inner.detach(stream_id);
        }
        self.release_rids(&released);
        debug!(stream_id, "stream cancelled");
    }

    /// Remove a finished subscription and release its upstream reference if
    /// still held. Called by the delivery layer after the event channel
    /// closes.
    pub fn finish(&self, stream_id: &str) {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.detach(stream_id) {
                if !entry.upstream_released {
                    released.push(entry.rid);
                }
            }
        }
        self.release_rids(&released);
    }

    /// Fetch a terminal event that could not be delivered in-band.
    pub fn take_final(&self, stream_id: &str) -> Option<StreamEvent> {
        self.inner
            .lock()
            .entries
            .get_mut(stream_id)
            .and_then(|e| e.pending_final.take())
    }

    /// Terminate every live subscription with the given terminal event.
    pub fn terminate_all(&self, event: impl Fn(&CompleteData) -> StreamEvent) {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            for entry in inner.entries.values_mut() {
                if entry.terminal {
                    continue;
                }
                let data = entry.complete_data(CompleteReason::Shutdown);
                finish(entry, event(&data), &mut released);
                self.stats.streams_completed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.release_rids(&released);
    }

    /// Best-effort `complete(shutdown)` to every subscriber.
    pub fn shutdown_all(&self) {
        self.terminate_all(|data| StreamEvent::Complete(data.clone()));
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn connection_stream_ids(&self, conn_id: u64) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.owner == StreamOwner::WebSocket { conn_id })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn stats_snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            active_streams: self.active_count(),
            streams_created: self.stats.streams_created.load(Ordering::Relaxed),
            streams_completed: self.stats.streams_completed.load(Ordering::Relaxed),
            slow_consumer_disconnects: self
                .stats
                .slow_consumer_disconnects
                .load(Ordering::Relaxed),
            ticks_published: self.stats.ticks_published.load(Ordering::Relaxed),
            clock_skew_violations: self.stats.clock_skew_violations.load(Ordering::Relaxed),
        }
    }

    fn release_rids(&self, rids: &[u32]) {
        for &rid in rids {
            self.session.unsubscribe(rid);
        }
    }

    /// Sweep expired timeouts. Driven by [`spawn_sweeper`].
    fn sweep_timeouts(&self) {
        let now = Instant::now();
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            for entry in inner.entries.values_mut() {
                if entry.terminal {
                    continue;
                }
                if entry.deadline.map(|d| d <= now).unwrap_or(false) {
                    let data = entry.complete_data(CompleteReason::Timeout);
                    finish(entry, StreamEvent::Complete(data), &mut released);
                    self.stats.streams_completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.release_rids(&released);
    }

    /// React to session-level notices: reconnect info, rid re-keys,
    /// terminal upstream loss, and per-contract rejections.
    fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::Reconnecting => {
                self.broadcast_info("reconnecting");
            }
            SessionNotice::Resubscribed { rekeys } => {
                let mut inner = self.inner.lock();
                for rekey in rekeys {
                    if let Some(ids) = inner.index.get(&(rekey.cid, rekey.tt)).cloned() {
                        for id in ids {
                            if let Some(entry) = inner.entries.get_mut(&id) {
                                entry.rid = rekey.new_rid;
                                if let Some(tx) = entry.tx.as_ref() {
                                    let _ = tx.try_send(StreamEvent::Info {
                                        status: "resubscribed".to_string(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
            SessionNotice::Failed => {
                self.terminate_all(|_| StreamEvent::Error(StreamError::upstream_lost()));
            }
            SessionNotice::ContractRejected {
                cid,
                tt,
                code,
                message,
                ..
            } => {
                let mut released = Vec::new();
                {
                    let mut inner = self.inner.lock();
                    if let Some(ids) = inner.index.get(&(cid, tt)).cloned() {
                        for id in ids {
                            if let Some(entry) = inner.entries.get_mut(&id) {
                                if entry.terminal {
                                    continue;
                                }
                                // The session already dropped the request.
                                entry.upstream_released = true;
                                finish(
                                    entry,
                                    StreamEvent::Error(StreamError::contract_unknown(
                                        cid,
                                        format!("{message} (code {code})"),
                                    )),
                                    &mut released,
                                );
                            }
                        }
                    }
                }
                self.release_rids(&released);
            }
        }
    }
}

fn immediate_reason(limits: &StreamLimits) -> Option<CompleteReason> {
    if limits.limit == Some(0) {
        return Some(CompleteReason::LimitReached);
    }
    if limits.timeout == Some(Duration::ZERO) {
        return Some(CompleteReason::Timeout);
    }
    None
}

/// Transition an entry to terminal, delivering `event` in-band when the
/// queue has room and parking it otherwise.
fn finish(entry: &mut SubEntry, event: StreamEvent, released: &mut Vec<u32>) {
    entry.terminal = true;
    if let Some(tx) = entry.tx.take() {
        if let Err(e) = tx.try_send(event) {
            entry.pending_final = Some(match e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            });
        }
    } else {
        entry.pending_final = Some(event);
    }
    if !entry.upstream_released {
        entry.upstream_released = true;
        if entry.rid != 0 {
            released.push(entry.rid);
        }
    }
}

/// Periodic timeout sweep.
pub fn spawn_sweeper(registry: Arc<StreamRegistry>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = tick.tick() => registry.sweep_timeouts(),
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Forward session notices into the registry.
pub fn spawn_notice_listener(
    registry: Arc<StreamRegistry>,
    session: Arc<UpstreamSession>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut notices = session.subscribe_notices();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = notices.recv() => match notice {
                    Ok(notice) => registry.handle_notice(notice),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "session notice listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::types::TickType;

    /// Registry wired to a session that will never connect; only paths that
    /// avoid the upstream (immediate completion, caps) are exercised here.
    fn offline_registry() -> Arc<StreamRegistry> {
        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            ports: vec![1],
            client_id: 1,
            connection_timeout: Duration::from_millis(10),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(10),
        };
        let (session, _rx) = UpstreamSession::spawn(config);
        StreamRegistry::new(
            session,
            RegistryLimits {
                max_streams: 4,
                max_streams_per_connection: 2,
                buffer_size: 8,
            },
        )
    }

    #[tokio::test]
    async fn test_zero_limit_completes_immediately() {
        let registry = offline_registry();
        let mut handle = registry
            .create(
                711280073,
                TickType::Last,
                StreamOwner::Sse,
                StreamLimits {
                    limit: Some(0),
                    timeout: None,
                },
            )
            .unwrap();

        match handle.rx.recv().await {
            Some(StreamEvent::Complete(data)) => {
                assert_eq!(data.reason, CompleteReason::LimitReached);
                assert_eq!(data.total_ticks, 0);
            }
            other => panic!("expected immediate complete, got {other:?}"),
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_completes_immediately() {
        let registry = offline_registry();
        let mut handle = registry
            .create(
                711280073,
                TickType::Last,
                StreamOwner::Sse,
                StreamLimits {
                    limit: None,
                    timeout: Some(Duration::ZERO),
                },
            )
            .unwrap();

        match handle.rx.recv().await {
            Some(StreamEvent::Complete(data)) => {
                assert_eq!(data.reason, CompleteReason::Timeout);
            }
            other => panic!("expected immediate complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_fails_when_disconnected() {
        let registry = offline_registry();
        let err = registry
            .create(
                711280073,
                TickType::Last,
                StreamOwner::Sse,
                StreamLimits::default(),
            )
            .expect_err("disconnected session must fail");
        assert_eq!(err.code, ErrorCode::NotConnected);
    }

    #[tokio::test]
    async fn test_cancel_unknown_stream_is_noop() {
        let registry = offline_registry();
        registry.cancel("711280073_last_1_1", true);
        registry.cancel("711280073_last_1_1", true);
        assert_eq!(registry.active_count(), 0);
    }
}
