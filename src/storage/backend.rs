//! Append-store backends.
//!
//! One `FileBackend` per enabled (encoding, schema) pair. Each backend owns
//! a writer task with a bounded inbound queue; the publish path never
//! blocks. The writer buffers messages and flushes on a size or interval
//! threshold, rotates files on hour boundaries and size caps, and fsyncs on
//! rotate rather than per record.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::storage::partition::{BackendKind, Encoding, PartitionKey, Schema};
use crate::storage::query;
use crate::storage::record;
use crate::types::{compact_to_verbose, now_micros, TickMessage, TickType};

/// Bound on the per-backend retry ring for failed writes.
const RETRY_RING_CAPACITY: usize = 256;

/// Drain deadline honored by `stop`.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Writer tuning knobs, derived from `StorageConfig`.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Inbound queue capacity; overflow drops the oldest queued message.
    pub queue_capacity: usize,
    /// Messages buffered before a flush is forced.
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub max_file_size: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            buffer_size: 1000,
            flush_interval: Duration::from_millis(250),
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

/// Monotonic counters for one backend.
#[derive(Debug, Default)]
pub struct BackendStats {
    pub messages_written: AtomicU64,
    pub write_errors: AtomicU64,
    pub overflow_dropped: AtomicU64,
    pub truncated_tails: AtomicU64,
    pub files_opened: AtomicU64,
    pub rotations: AtomicU64,
    /// Microsecond timestamp of the last successful write.
    pub last_write_micros: AtomicU64,
    pub queue_depth: AtomicU64,
}

/// Point-in-time stats view, serialized on `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatsSnapshot {
    pub backend: String,
    pub queue_depth: u64,
    pub messages_written: u64,
    pub write_errors: u64,
    pub overflow_dropped: u64,
    pub truncated_tails: u64,
    pub newest_file_age_seconds: Option<f64>,
}

impl BackendStats {
    pub fn snapshot(&self, label: String) -> BackendStatsSnapshot {
        let last = self.last_write_micros.load(Ordering::Relaxed);
        let newest_file_age_seconds = if last == 0 {
            None
        } else {
            Some((now_micros().saturating_sub(last)) as f64 / 1e6)
        };
        BackendStatsSnapshot {
            backend: label,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            messages_written: self.messages_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            truncated_tails: self.truncated_tails.load(Ordering::Relaxed),
            newest_file_age_seconds,
        }
    }
}

/// Bounded range query over the store.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub cid: u32,
    pub tick_types: Vec<TickType>,
    pub start_micros: u64,
    pub end_micros: u64,
    pub limit: Option<usize>,
}

/// Uniform interface over on-disk backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the backend root and spawn the writer task.
    async fn start(&self) -> Result<()>;

    /// Drain and close, bounded by [`SHUTDOWN_DRAIN_DEADLINE`].
    async fn stop(&self);

    /// Enqueue a batch; never blocks the caller.
    fn store_batch(&self, batch: &[TickMessage]);

    /// Stream records whose `ts` falls inside the query range, merged across
    /// tick types in ascending `ts` order. The result is lazy; whole files
    /// are never loaded into memory.
    fn query_range(&self, query: RangeQuery) -> mpsc::Receiver<TickMessage>;

    fn stats(&self) -> BackendStatsSnapshot;
}

/// Bounded drop-oldest inbound queue shared between publishers and the
/// writer task.
struct Inbound {
    queue: Mutex<VecDeque<TickMessage>>,
    capacity: usize,
    notify: Notify,
}

impl Inbound {
    fn push(&self, msg: TickMessage, stats: &BackendStats) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(msg);
            if queue.len() > self.capacity {
                queue.pop_front();
                stats.overflow_dropped.fetch_add(1, Ordering::Relaxed);
            }
            stats.queue_depth.store(queue.len() as u64, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    fn drain(&self, into: &mut Vec<TickMessage>, stats: &BackendStats) {
        let mut queue = self.queue.lock();
        into.extend(queue.drain(..));
        stats.queue_depth.store(0, Ordering::Relaxed);
    }
}

/// Time-partitioned append-only file backend.
pub struct FileBackend {
    kind: BackendKind,
    base_dir: PathBuf,
    config: WriterConfig,
    inbound: Arc<Inbound>,
    stats: Arc<BackendStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileBackend {
    pub fn new(storage_root: &std::path::Path, kind: BackendKind, config: WriterConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            kind,
            base_dir: kind.base_dir(storage_root),
            inbound: Arc::new(Inbound {
                queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
                capacity: config.queue_capacity,
                notify: Notify::new(),
            }),
            config,
            stats: Arc::new(BackendStats::default()),
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("creating backend dir {}", self.base_dir.display()))?;

        let mut writer = PartitionWriter {
            base_dir: self.base_dir.clone(),
            kind: self.kind,
            max_file_size: self.config.max_file_size,
            open_files: HashMap::new(),
            retry: VecDeque::with_capacity(RETRY_RING_CAPACITY),
            stats: self.stats.clone(),
        };

        let inbound = self.inbound.clone();
        let stats = self.stats.clone();
        let buffer_size = self.config.buffer_size;
        let flush_interval = self.config.flush_interval;
        let mut shutdown = self.shutdown_rx.clone();
        let label = self.kind.label();

        let handle = tokio::spawn(async move {
            let mut flush_tick = tokio::time::interval(flush_interval);
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut pending: Vec<TickMessage> = Vec::with_capacity(buffer_size);

            loop {
                tokio::select! {
                    _ = inbound.notify.notified() => {
                        inbound.drain(&mut pending, &stats);
                        if pending.len() >= buffer_size {
                            writer.flush(&mut pending);
                        }
                    }
                    _ = flush_tick.tick() => {
                        inbound.drain(&mut pending, &stats);
                        if !pending.is_empty() {
                            writer.flush(&mut pending);
                        }
                        writer.roll_stale_hours();
                    }
                    _ = shutdown.changed() => {
                        inbound.drain(&mut pending, &stats);
                        writer.flush(&mut pending);
                        writer.close_all();
                        debug!(backend = %label, "storage writer drained and closed");
                        break;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        info!(backend = %self.kind.label(), dir = %self.base_dir.display(), "storage backend started");
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, handle).await.is_err() {
                warn!(backend = %self.kind.label(), "storage writer missed drain deadline; aborting");
            }
        }
    }

    fn store_batch(&self, batch: &[TickMessage]) {
        for msg in batch {
            self.inbound.push(msg.clone(), &self.stats);
        }
    }

    fn query_range(&self, query: RangeQuery) -> mpsc::Receiver<TickMessage> {
        let (tx, rx) = mpsc::channel(256);
        let base_dir = self.base_dir.clone();
        let kind = self.kind;
        let stats = self.stats.clone();
        tokio::task::spawn_blocking(move || {
            query::scan_range(&base_dir, kind, &query, &stats, tx);
        });
        rx
    }

    fn stats(&self) -> BackendStatsSnapshot {
        self.stats.snapshot(self.kind.label())
    }
}

/// One open partition file.
struct OpenPartition {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

/// Synchronous writer state, owned by the writer task. Each partition file
/// has exactly one writer.
struct PartitionWriter {
    base_dir: PathBuf,
    kind: BackendKind,
    max_file_size: u64,
    open_files: HashMap<PartitionKey, OpenPartition>,
    retry: VecDeque<TickMessage>,
    stats: Arc<BackendStats>,
}

impl PartitionWriter {
    fn flush(&mut self, pending: &mut Vec<TickMessage>) {
        let retries: Vec<TickMessage> = self.retry.drain(..).collect();
        for msg in retries.into_iter().chain(pending.drain(..)) {
            self.write_one(msg);
        }
        for partition in self.open_files.values_mut() {
            if let Err(e) = partition.writer.flush() {
                warn!(path = %partition.path.display(), error = %e, "partition flush failed");
            }
        }
    }

    fn write_one(&mut self, msg: TickMessage) {
        let key = PartitionKey::from_micros(msg.cid, msg.tt, msg.ts);
        let bytes = match self.encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Serialization failures are not retryable.
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(backend = %self.kind.label(), error = %e, "failed to encode tick record");
                return;
            }
        };

        match self.append(key, &bytes, msg.ts) {
            Ok(()) => {
                self.stats.messages_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .last_write_micros
                    .store(now_micros(), Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %self.kind.label(), error = %e, "tick write failed; queued for retry");
                if self.retry.len() >= RETRY_RING_CAPACITY {
                    self.retry.pop_front();
                    self.stats.overflow_dropped.fetch_add(1, Ordering::Relaxed);
                }
                self.retry.push_back(msg);
            }
        }
    }

    fn encode(&self, msg: &TickMessage) -> Result<Vec<u8>> {
        Ok(match (self.kind.encoding, self.kind.schema) {
            (Encoding::Json, Schema::V3) => {
                let mut bytes = serde_json::to_vec(msg)?;
                bytes.push(b'\n');
                bytes
            }
            (Encoding::Json, Schema::V2) => {
                let mut bytes = serde_json::to_vec(&compact_to_verbose(msg))?;
                bytes.push(b'\n');
                bytes
            }
            (Encoding::Protobuf, Schema::V3) => record::encode_framed(msg),
            (Encoding::Protobuf, Schema::V2) => {
                // Length-prefixed verbose payload; the frame layout matches
                // the compact binary backend so readers share framing.
                let payload = serde_json::to_vec(&compact_to_verbose(msg))?;
                let mut bytes = Vec::with_capacity(4 + payload.len());
                bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                bytes.extend_from_slice(&payload);
                bytes
            }
        })
    }

    fn append(&mut self, key: PartitionKey, bytes: &[u8], ts_micros: u64) -> std::io::Result<()> {
        if !self.open_files.contains_key(&key) {
            let dir = key.dir(&self.base_dir);
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(key.file_name(ts_micros, self.kind.encoding.extension()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
            self.open_files.insert(
                key,
                OpenPartition {
                    writer: BufWriter::new(file),
                    path,
                    bytes_written: 0,
                },
            );
        }

        // Single buffered write: length prefix and payload never split.
        let should_rotate = {
            let partition = self.open_files.get_mut(&key).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "partition vanished")
            })?;
            partition.writer.write_all(bytes)?;
            partition.bytes_written += bytes.len() as u64;
            partition.bytes_written >= self.max_file_size
        };

        if should_rotate {
            self.rotate(key);
        }
        Ok(())
    }

    /// Close a partition after syncing it; the next append reopens a fresh
    /// file stamped with its own open time.
    fn rotate(&mut self, key: PartitionKey) {
        if let Some(partition) = self.open_files.remove(&key) {
            self.sync_and_drop(partition);
            self.stats.rotations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close partitions for hours that have passed on the wall clock.
    fn roll_stale_hours(&mut self) {
        let current = PartitionKey::from_micros(0, TickType::Last, now_micros());
        let current_hour = (current.year, current.month, current.day, current.hour);
        let stale: Vec<PartitionKey> = self
            .open_files
            .keys()
            .filter(|k| (k.year, k.month, k.day, k.hour) < current_hour)
            .copied()
            .collect();
        for key in stale {
            self.rotate(key);
        }
    }

    fn close_all(&mut self) {
        let partitions: Vec<OpenPartition> = self.open_files.drain().map(|(_, p)| p).collect();
        for partition in partitions {
            self.sync_and_drop(partition);
        }
    }

    fn sync_and_drop(&self, mut partition: OpenPartition) {
        if let Err(e) = partition.writer.flush() {
            warn!(path = %partition.path.display(), error = %e, "flush on close failed");
            return;
        }
        if let Err(e) = partition.writer.get_ref().sync_all() {
            warn!(path = %partition.path.display(), error = %e, "fsync on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickType;

    fn sample(ts: u64) -> TickMessage {
        let mut msg = TickMessage::new(ts, ts + 37, 711280073, TickType::BidAsk, 3520);
        msg.bp = Some(23260.0);
        msg.bs = Some(4.0);
        msg.ap = Some(23260.5);
        msg.as_ = Some(2.0);
        msg
    }

    const TS: u64 = 1754008313000000;

    #[tokio::test]
    async fn test_write_then_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), BackendKind::JSON_V3, WriterConfig::default());
        backend.start().await.unwrap();

        let batch: Vec<TickMessage> = (0..5).map(|i| sample(TS + i * 1000)).collect();
        backend.store_batch(&batch);
        backend.stop().await;

        let mut rx = backend.query_range(RangeQuery {
            cid: 711280073,
            tick_types: vec![TickType::BidAsk],
            start_micros: TS,
            end_micros: TS + 10_000,
            limit: None,
        });
        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            seen.push(msg);
        }
        assert_eq!(seen, batch);
    }

    #[tokio::test]
    async fn test_binary_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), BackendKind::PROTOBUF_V3, WriterConfig::default());
        backend.start().await.unwrap();

        let batch: Vec<TickMessage> = (0..3).map(|i| sample(TS + i * 500)).collect();
        backend.store_batch(&batch);
        backend.stop().await;

        let mut rx = backend.query_range(RangeQuery {
            cid: 711280073,
            tick_types: vec![TickType::BidAsk],
            start_micros: TS,
            end_micros: TS + 10_000,
            limit: Some(2),
        });
        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            seen.push(msg);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], batch[0]);
    }

    #[tokio::test]
    async fn test_disabled_backend_creates_no_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let _backend = FileBackend::new(dir.path(), BackendKind::JSON_V2, WriterConfig::default());
        // Never started: the backend directory must not exist.
        assert!(!dir.path().join("json").exists());
    }

    #[test]
    fn test_inbound_overflow_drops_oldest() {
        let stats = BackendStats::default();
        let inbound = Inbound {
            queue: Mutex::new(VecDeque::new()),
            capacity: 2,
            notify: Notify::new(),
        };
        inbound.push(sample(TS), &stats);
        inbound.push(sample(TS + 1), &stats);
        inbound.push(sample(TS + 2), &stats);

        let mut drained = Vec::new();
        inbound.drain(&mut drained, &stats);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].ts, TS + 1);
        assert_eq!(stats.overflow_dropped.load(Ordering::Relaxed), 1);
    }
}
