//! Upstream session: one long-lived gateway connection.
//!
//! The session owns the monotonic request-id counter and the table mapping
//! request ids to (contract, tick type) with share counts. Subscriptions
//! for the same (contract, tick type) share one upstream request. The
//! socket is driven by a single task; state mutation goes through one
//! mutex with O(1) critical sections, and inbound ticks are handed to the
//! pipeline with a non-blocking send.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::errors::StreamError;
use crate::types::{now_micros, TickMessage, TickType};
use crate::upstream::protocol::{self, RequestMessage, ResponseMessage, UpstreamEvent};

/// Connection lifecycle, published for `/health` and the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Session-level notifications consumed by the stream registry.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// The socket dropped with requests outstanding; a reconnect is underway.
    Reconnecting,
    /// Reconnect succeeded; every entry was replayed under a fresh rid.
    Resubscribed { rekeys: Vec<Rekey> },
    /// Reconnect attempts are exhausted; the session is terminal.
    Failed,
    /// The gateway rejected one request; its entry has been removed.
    ContractRejected {
        rid: u32,
        cid: u32,
        tt: TickType,
        code: i32,
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Rekey {
    pub old_rid: u32,
    pub new_rid: u32,
    pub cid: u32,
    pub tt: TickType,
}

/// Session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub ticks_received: AtomicU64,
    pub orphan_ticks: AtomicU64,
    pub publish_drops: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatsSnapshot {
    pub state: SessionState,
    pub outstanding_requests: usize,
    pub ticks_received: u64,
    pub orphan_ticks: u64,
    pub publish_drops: u64,
    pub reconnects: u64,
}

/// One upstream request shared by every subscription with equal (cid, tt).
#[derive(Debug, Clone)]
struct RequestEntry {
    cid: u32,
    tt: TickType,
    refcount: u32,
    last_tick_at: u64,
}

#[derive(Debug, Default)]
struct RequestTable {
    by_rid: HashMap<u32, RequestEntry>,
    by_key: HashMap<(u32, TickType), u32>,
    next_rid: u32,
}

impl RequestTable {
    fn new() -> Self {
        Self {
            by_rid: HashMap::new(),
            by_key: HashMap::new(),
            next_rid: 1,
        }
    }

    /// Share an existing request or allocate a fresh rid. Returns
    /// `(rid, newly_allocated)`.
    fn acquire(&mut self, cid: u32, tt: TickType) -> (u32, bool) {
        if let Some(&rid) = self.by_key.get(&(cid, tt)) {
            if let Some(entry) = self.by_rid.get_mut(&rid) {
                entry.refcount += 1;
            }
            return (rid, false);
        }
        let rid = self.next_rid;
        self.next_rid += 1;
        self.by_rid.insert(
            rid,
            RequestEntry {
                cid,
                tt,
                refcount: 1,
                last_tick_at: 0,
            },
        );
        self.by_key.insert((cid, tt), rid);
        (rid, true)
    }

    /// Drop one reference; the entry is removed exactly when the count hits
    /// zero. Unknown rids are a no-op.
    fn release(&mut self, rid: u32) -> ReleaseOutcome {
        let Some(entry) = self.by_rid.get_mut(&rid) else {
            return ReleaseOutcome::Unknown;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let entry = self.by_rid.remove(&rid).unwrap_or_else(|| unreachable!());
            self.by_key.remove(&(entry.cid, entry.tt));
            ReleaseOutcome::Removed
        } else {
            ReleaseOutcome::Shared
        }
    }

    fn remove(&mut self, rid: u32) -> Option<RequestEntry> {
        let entry = self.by_rid.remove(&rid)?;
        self.by_key.remove(&(entry.cid, entry.tt));
        Some(entry)
    }

    /// Assign fresh rids to every entry, preserving refcounts. Used on
    /// reconnect.
    fn rekey_all(&mut self) -> Vec<Rekey> {
        let old: Vec<(u32, RequestEntry)> = self.by_rid.drain().collect();
        self.by_key.clear();
        let mut rekeys = Vec::with_capacity(old.len());
        for (old_rid, entry) in old {
            let new_rid = self.next_rid;
            self.next_rid += 1;
            rekeys.push(Rekey {
                old_rid,
                new_rid,
                cid: entry.cid,
                tt: entry.tt,
            });
            self.by_key.insert((entry.cid, entry.tt), new_rid);
            self.by_rid.insert(new_rid, entry);
        }
        rekeys.sort_by_key(|r| r.new_rid);
        rekeys
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReleaseOutcome {
    Removed,
    Shared,
    Unknown,
}

enum WireCommand {
    Send(RequestMessage),
    Close,
}

/// The upstream session handle shared across the application.
pub struct UpstreamSession {
    config: ConnectionConfig,
    table: Mutex<RequestTable>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    notice_tx: broadcast::Sender<SessionNotice>,
    cmd_tx: mpsc::Sender<WireCommand>,
    publish_tx: mpsc::Sender<TickMessage>,
    stats: SessionStats,
}

impl UpstreamSession {
    /// Spawn the session worker. Ticks stream out of the returned receiver
    /// in broker-arrival order.
    pub fn spawn(config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<TickMessage>) {
        let (publish_tx, publish_rx) = mpsc::channel(2048);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (notice_tx, _) = broadcast::channel(64);

        let session = Arc::new(Self {
            config,
            table: Mutex::new(RequestTable::new()),
            state_tx,
            state_rx,
            notice_tx,
            cmd_tx,
            publish_tx,
            stats: SessionStats::default(),
        });

        let worker = session.clone();
        tokio::spawn(async move {
            worker.run(cmd_rx).await;
        });

        (session, publish_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notice_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn stats_snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            state: self.state(),
            outstanding_requests: self.table.lock().by_rid.len(),
            ticks_received: self.stats.ticks_received.load(Ordering::Relaxed),
            orphan_ticks: self.stats.orphan_ticks.load(Ordering::Relaxed),
            publish_drops: self.stats.publish_drops.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Wait for the first connection. Fails with `UPSTREAM_UNAVAILABLE`
    /// when no configured port accepts within the connection timeout.
    pub async fn open(&self) -> Result<(), StreamError> {
        let deadline = self.config.connection_timeout * self.config.ports.len().max(1) as u32
            + Duration::from_secs(2);
        let mut state = self.state_rx.clone();
        let wait = async {
            loop {
                match *state.borrow() {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed => return Err(()),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(());
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(StreamError::upstream_unavailable(format!(
                "no reachable gateway on {}:{:?}",
                self.config.host, self.config.ports
            ))),
        }
    }

    /// Subscribe to (cid, tt), sharing an existing upstream request when one
    /// is outstanding. Returns the request id.
    pub fn subscribe(&self, cid: u32, tt: TickType) -> Result<u32, StreamError> {
        if !self.is_connected() {
            return Err(StreamError::not_connected());
        }

        let (rid, newly_allocated) = self.table.lock().acquire(cid, tt);
        if newly_allocated {
            let request = protocol::encode_tick_by_tick(rid, cid, tt);
            if self.cmd_tx.try_send(WireCommand::Send(request)).is_err() {
                // Roll the allocation back; the caller sees a clean failure.
                self.table.lock().remove(rid);
                return Err(StreamError::not_connected());
            }
            debug!(rid, cid, tt = %tt, "upstream subscribe sent");
        } else {
            debug!(rid, cid, tt = %tt, "sharing existing upstream request");
        }
        Ok(rid)
    }

    /// Release one reference on `rid`; the cancel is sent when the last
    /// holder releases. Safe to call with an unknown or already-released
    /// rid.
    pub fn unsubscribe(&self, rid: u32) {
        let outcome = self.table.lock().release(rid);
        match outcome {
            ReleaseOutcome::Removed => {
                let _ = self
                    .cmd_tx
                    .try_send(WireCommand::Send(protocol::encode_cancel_tick_by_tick(rid)));
                debug!(rid, "upstream cancel sent");
            }
            ReleaseOutcome::Shared => debug!(rid, "upstream request still shared"),
            ReleaseOutcome::Unknown => debug!(rid, "unsubscribe for unknown rid ignored"),
        }
    }

    /// Cancel every entry and close the socket.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(WireCommand::Close).await;
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<WireCommand>) {
        let mut consecutive_failures: u32 = 0;
        let mut delay = self.config.reconnect_delay;
        let max_delay = Duration::from_secs(30);
        let mut first_attempt = true;

        loop {
            self.set_state(if first_attempt {
                SessionState::Connecting
            } else {
                SessionState::Reconnecting
            });

            match self.connect().await {
                Ok(stream) => {
                    consecutive_failures = 0;
                    delay = self.config.reconnect_delay;

                    if !first_attempt {
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    }

                    match self.drive(stream, &mut cmd_rx, first_attempt).await {
                        DriveExit::Shutdown => {
                            self.set_state(SessionState::Disconnected);
                            info!("upstream session closed");
                            return;
                        }
                        DriveExit::SocketLost => {
                            let outstanding = self.table.lock().by_rid.len();
                            warn!(outstanding, "upstream socket lost");
                            if outstanding > 0 {
                                let _ = self.notice_tx.send(SessionNotice::Reconnecting);
                            }
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        attempt = consecutive_failures,
                        max = self.config.reconnect_attempts,
                        error = %e,
                        "upstream connect failed"
                    );
                    if consecutive_failures >= self.config.reconnect_attempts {
                        error!("upstream reconnect attempts exhausted; session failed");
                        self.set_state(SessionState::Failed);
                        let _ = self.notice_tx.send(SessionNotice::Failed);
                        return;
                    }
                }
            }

            first_attempt = false;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    /// Try each configured port in order; handshake on the first that
    /// accepts.
    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let mut last_err = anyhow::anyhow!("no ports configured");
        for &port in &self.config.ports {
            let addr = format!("{}:{}", self.config.host, port);
            let attempt = async {
                let mut stream = TcpStream::connect(&addr).await?;
                stream.set_nodelay(true)?;
                self.handshake(&mut stream).await?;
                anyhow::Ok(stream)
            };
            match tokio::time::timeout(self.config.connection_timeout, attempt).await {
                Ok(Ok(stream)) => {
                    info!(addr = %addr, client_id = self.config.client_id, "connected to gateway");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "gateway port refused");
                    last_err = e;
                }
                Err(_) => {
                    debug!(addr = %addr, "gateway connect timed out");
                    last_err = anyhow::anyhow!("connect to {addr} timed out");
                }
            }
        }
        Err(last_err)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        stream.write_all(&protocol::handshake_bytes()).await?;
        let payload = protocol::read_frame(stream).await?;
        let mut response = ResponseMessage::from_payload(&payload);
        let handshake = protocol::parse_handshake(&mut response)?;
        debug!(
            server_version = handshake.server_version,
            server_time = %handshake.server_time,
            "gateway handshake complete"
        );
        protocol::write_frame(
            stream,
            &protocol::encode_start_api(self.config.client_id).encode(),
        )
        .await?;
        Ok(())
    }

    /// Drive one established connection until shutdown or socket loss.
    async fn drive(
        &self,
        stream: TcpStream,
        cmd_rx: &mut mpsc::Receiver<WireCommand>,
        first_attempt: bool,
    ) -> DriveExit {
        let (mut reader, mut writer) = stream.into_split();

        // Replay outstanding requests under fresh rids before any new
        // traffic. Subscriber state survives; only the rids change.
        if !first_attempt {
            let rekeys = self.table.lock().rekey_all();
            for rekey in &rekeys {
                let request = protocol::encode_tick_by_tick(rekey.new_rid, rekey.cid, rekey.tt);
                if protocol::write_frame(&mut writer, &request.encode()).await.is_err() {
                    return DriveExit::SocketLost;
                }
            }
            if !rekeys.is_empty() {
                info!(count = rekeys.len(), "replayed upstream subscriptions");
                let _ = self.notice_tx.send(SessionNotice::Resubscribed { rekeys });
            }
        }

        self.set_state(SessionState::Connected);

        // Frame reads are not cancellation-safe, so a dedicated task owns
        // the read half and feeds whole payloads through a channel.
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(256);
        let reader_task = tokio::spawn(async move {
            loop {
                match protocol::read_frame(&mut reader).await {
                    Ok(payload) => {
                        if frame_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "upstream read ended");
                        break;
                    }
                }
            }
        });

        let exit = loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(payload) => self.handle_payload(&payload),
                        None => break DriveExit::SocketLost,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WireCommand::Send(message)) => {
                            if protocol::write_frame(&mut writer, &message.encode()).await.is_err() {
                                break DriveExit::SocketLost;
                            }
                        }
                        Some(WireCommand::Close) | None => {
                            let rids: Vec<u32> = {
                                let mut table = self.table.lock();
                                let rids = table.by_rid.keys().copied().collect();
                                table.by_rid.clear();
                                table.by_key.clear();
                                rids
                            };
                            for rid in rids {
                                let cancel = protocol::encode_cancel_tick_by_tick(rid);
                                let _ = protocol::write_frame(&mut writer, &cancel.encode()).await;
                            }
                            break DriveExit::Shutdown;
                        }
                    }
                }
            }
        };

        reader_task.abort();
        exit
    }

    /// Inbound dispatch. Does O(1) work per tick and never blocks: the
    /// pipeline handoff is a bounded `try_send`.
    fn handle_payload(&self, payload: &str) {
        let mut message = ResponseMessage::from_payload(payload);
        match protocol::decode_event(&mut message) {
            Ok(UpstreamEvent::Tick { rid, raw }) => {
                self.stats.ticks_received.fetch_add(1, Ordering::Relaxed);
                let st = now_micros();

                let cid = {
                    let mut table = self.table.lock();
                    match table.by_rid.get_mut(&rid) {
                        Some(entry) => {
                            entry.last_tick_at = st;
                            entry.cid
                        }
                        None => {
                            drop(table);
                            self.stats.orphan_ticks.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                };

                let msg = protocol::encode_tick(&raw, cid, rid, st);
                if self.publish_tx.try_send(msg).is_err() {
                    self.stats.publish_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(UpstreamEvent::Error { rid, code, message }) => {
                if rid > 0 && protocol::is_contract_rejection(code) {
                    let removed = self.table.lock().remove(rid as u32);
                    if let Some(entry) = removed {
                        warn!(rid, code, message = %message, "gateway rejected subscription");
                        let _ = self.notice_tx.send(SessionNotice::ContractRejected {
                            rid: rid as u32,
                            cid: entry.cid,
                            tt: entry.tt,
                            code,
                            message,
                        });
                    }
                } else {
                    // Informational gateway chatter (farm status etc).
                    debug!(rid, code, message = %message, "gateway notice");
                }
            }
            Ok(UpstreamEvent::Other { message_type }) => {
                debug!(message_type, "ignoring gateway message");
            }
            Err(e) => {
                warn!(error = %e, "failed to decode gateway message");
            }
        }
    }
}

enum DriveExit {
    Shutdown,
    SocketLost,
}
