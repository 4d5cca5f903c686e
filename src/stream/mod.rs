//! Stream multiplexing: registry, fan-out pipeline, and the background
//! tracker.

pub mod registry;
pub mod tracker;

pub use registry::{
    spawn_notice_listener, spawn_sweeper, RegistryLimits, RegistryStatsSnapshot, StreamEvent,
    StreamHandle, StreamLimits, StreamOwner, StreamRegistry,
};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::MultiStorage;
use crate::types::TickMessage;

/// Route every upstream tick to live subscribers and the append store.
/// A single consumer preserves broker-arrival order per (cid, tt) on both
/// paths.
pub fn spawn_pipeline(
    mut ticks: mpsc::Receiver<TickMessage>,
    registry: Arc<StreamRegistry>,
    storage: Arc<MultiStorage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = ticks.recv().await {
            registry.publish(&msg);
            storage.store(&msg);
        }
    })
}
