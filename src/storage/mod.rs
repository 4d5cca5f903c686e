//! Append-only, time-partitioned tick store.
//!
//! Writes fan out across an (encoding × schema) matrix of backends; reads
//! pick one backend and stream a bounded `ts` range. Files are append-only
//! and never rewritten.

pub mod backend;
pub mod multi;
pub mod partition;
pub mod query;
pub mod record;

pub use backend::{
    BackendStats, BackendStatsSnapshot, FileBackend, RangeQuery, StorageBackend, WriterConfig,
};
pub use multi::MultiStorage;
pub use partition::{BackendKind, Encoding, PartitionKey, Schema};
