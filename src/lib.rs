//! Tick streaming gateway library.
//!
//! Exposes the core modules for the service binary, the offline tools, and
//! integration tests.

pub mod api;
pub mod config;
pub mod errors;
pub mod storage;
pub mod stream;
pub mod types;
pub mod upstream;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::config::Config;
use crate::storage::MultiStorage;
use crate::stream::StreamRegistry;
use crate::upstream::UpstreamSession;

/// Application state shared across all handlers and tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session: Arc<UpstreamSession>,
    pub registry: Arc<StreamRegistry>,
    pub storage: Arc<MultiStorage>,
    /// Allocator for WebSocket connection ids.
    pub next_conn_id: Arc<AtomicU64>,
    /// Currently open WebSocket data connections.
    pub ws_connections: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        session: Arc<UpstreamSession>,
        registry: Arc<StreamRegistry>,
        storage: Arc<MultiStorage>,
    ) -> Self {
        Self {
            config,
            session,
            registry,
            storage,
            next_conn_id: Arc::new(AtomicU64::new(1)),
            ws_connections: Arc::new(AtomicU64::new(0)),
        }
    }
}
