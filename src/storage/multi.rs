//! Composite store: fans writes out to every enabled backend and routes
//! reads to one backend chosen by requested format.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::StorageConfig;
use crate::errors::{ErrorCode, StreamError};
use crate::storage::backend::{
    BackendStatsSnapshot, FileBackend, RangeQuery, StorageBackend, WriterConfig,
};
use crate::storage::partition::{BackendKind, Encoding, Schema};
use crate::types::{ingest_verbose, TickMessage, VerboseRecord};

/// Fan-out over the enabled (encoding × schema) matrix.
pub struct MultiStorage {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl MultiStorage {
    /// Build backends for every enabled matrix cell. Disabled cells get no
    /// backend and therefore no directories.
    pub fn from_config(config: &StorageConfig) -> Self {
        let mut kinds = Vec::new();
        if config.enable_storage {
            if config.enable_json && config.enable_v2 {
                kinds.push(BackendKind::JSON_V2);
            }
            if config.enable_json && config.enable_v3 {
                kinds.push(BackendKind::JSON_V3);
            }
            if config.enable_protobuf && config.enable_v3 {
                kinds.push(BackendKind::PROTOBUF_V3);
            }
            if config.enable_protobuf && config.enable_v2 {
                kinds.push(BackendKind::PROTOBUF_V2);
            }
        }

        let writer_config = WriterConfig {
            queue_capacity: config.buffer_size.max(1),
            buffer_size: config.buffer_size.max(1),
            flush_interval: config.flush_interval,
            max_file_size: config.max_file_size,
        };

        let backends = kinds
            .into_iter()
            .map(|kind| {
                Arc::new(FileBackend::new(
                    &config.storage_path,
                    kind,
                    writer_config.clone(),
                )) as Arc<dyn StorageBackend>
            })
            .collect();

        Self { backends }
    }

    pub fn is_enabled(&self) -> bool {
        !self.backends.is_empty()
    }

    pub async fn start(&self) -> Result<()> {
        for backend in &self.backends {
            backend.start().await?;
        }
        if self.is_enabled() {
            let labels: Vec<String> = self.backends.iter().map(|b| b.kind().label()).collect();
            info!(backends = ?labels, "append store started");
        } else {
            info!("append store disabled");
        }
        Ok(())
    }

    /// Drain all backends in parallel so the shutdown deadline is shared,
    /// not additive.
    pub async fn stop(&self) {
        futures_util::future::join_all(self.backends.iter().map(|b| b.stop())).await;
    }

    /// Record one tick in every enabled backend. Never blocks.
    pub fn store(&self, msg: &TickMessage) {
        for backend in &self.backends {
            backend.store_batch(std::slice::from_ref(msg));
        }
    }

    /// Back-compat ingest: convert a verbose envelope and fan it out.
    pub fn store_verbose(&self, record: &VerboseRecord) -> Result<(), StreamError> {
        let msg = ingest_verbose(record)?;
        self.store(&msg);
        Ok(())
    }

    /// Stream a bounded range from the backend matching `format`, preferring
    /// the compact schema when both are on disk.
    pub fn query_range(
        &self,
        query: RangeQuery,
        format: Encoding,
    ) -> Result<mpsc::Receiver<TickMessage>, StreamError> {
        let backend = self
            .backends
            .iter()
            .find(|b| b.kind().encoding == format && b.kind().schema == Schema::V3)
            .or_else(|| self.backends.iter().find(|b| b.kind().encoding == format))
            .ok_or_else(|| {
                StreamError::new(
                    ErrorCode::InvalidRequest,
                    format!("no {} backend enabled", format.dir_name()),
                    false,
                )
            })?;
        Ok(backend.query_range(query))
    }

    pub fn stats(&self) -> Vec<BackendStatsSnapshot> {
        self.backends.iter().map(|b| b.stats()).collect()
    }

    /// Coarse health used by `/health`: degraded once any backend has
    /// recorded write errors.
    pub fn health(&self) -> &'static str {
        if !self.is_enabled() {
            return "disabled";
        }
        if self.stats().iter().any(|s| s.write_errors > 0) {
            "degraded"
        } else {
            "ok"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickType;
    use std::time::Duration;

    const TS: u64 = 1754008313000000;

    fn test_config(root: &std::path::Path) -> StorageConfig {
        StorageConfig {
            enable_storage: true,
            storage_path: root.to_path_buf(),
            enable_json: true,
            enable_protobuf: true,
            enable_v2: true,
            enable_v3: true,
            enable_background_streaming: false,
            tracked_contracts: Vec::new(),
            background_reconnect_delay: Duration::from_secs(1),
            buffer_size: 100,
            max_file_size: 1024 * 1024,
            flush_interval: Duration::from_millis(50),
        }
    }

    fn sample(ts: u64) -> TickMessage {
        let mut msg = TickMessage::new(ts, ts + 37, 711280073, TickType::BidAsk, 3520);
        msg.bp = Some(23260.0);
        msg.bs = Some(4.0);
        msg.ap = Some(23260.5);
        msg.as_ = Some(2.0);
        msg
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = MultiStorage::from_config(&test_config(dir.path()));
        store.start().await.unwrap();
        assert_eq!(store.stats().len(), 4);

        for i in 0..3 {
            store.store(&sample(TS + i * 1000));
        }
        store.stop().await;

        for format in [Encoding::Json, Encoding::Protobuf] {
            let mut rx = store
                .query_range(
                    RangeQuery {
                        cid: 711280073,
                        tick_types: vec![TickType::BidAsk],
                        start_micros: TS,
                        end_micros: TS + 10_000,
                        limit: None,
                    },
                    format,
                )
                .unwrap();
            let mut count = 0;
            while let Some(msg) = rx.recv().await {
                assert_eq!(msg.rid, 3520);
                count += 1;
            }
            assert_eq!(count, 3);
        }
    }

    #[tokio::test]
    async fn test_verbose_ingest_converts_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = MultiStorage::from_config(&test_config(dir.path()));
        store.start().await.unwrap();

        let record = crate::types::compact_to_verbose(&sample(TS));
        store.store_verbose(&record).unwrap();
        store.stop().await;

        let mut rx = store
            .query_range(
                RangeQuery {
                    cid: 711280073,
                    tick_types: vec![TickType::BidAsk],
                    start_micros: TS,
                    end_micros: TS + 1000,
                    limit: None,
                },
                Encoding::Json,
            )
            .unwrap();
        let msg = rx.recv().await.expect("one stored record");
        assert_eq!(msg.rid, 3520);
        assert_eq!(msg.ts, TS);
    }

    #[tokio::test]
    async fn test_disabled_storage_has_no_backends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.enable_storage = false;
        let store = MultiStorage::from_config(&config);
        assert!(!store.is_enabled());
        assert_eq!(store.health(), "disabled");
        assert!(store
            .query_range(
                RangeQuery {
                    cid: 1,
                    tick_types: vec![TickType::Last],
                    start_micros: 0,
                    end_micros: 1,
                    limit: None,
                },
                Encoding::Json,
            )
            .is_err());
    }
}
