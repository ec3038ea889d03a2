//! Runaway-query detection, quarantine and record persistence.
//!
//! [`RunawayManager`] is the query-path facade: it keeps the watch list and
//! queues records without blocking. [`RunawayPipeline`] drains those queues
//! into the `mysql.holo_runaway_*` system tables and keeps the watch list in
//! sync with rows written by other nodes.

pub mod checker;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod syncer;
pub mod ttl_cache;

pub use checker::{QueryLimit, RunawayChecker, WatchSetting};
pub use config::RunawayConfig;
pub use error::RunawayError;
pub use manager::{RunawayChannels, RunawayManager, WatchHit, WatchOutcome};
pub use metrics::{RunawayMetrics, RunawayMetricsSnapshot};
pub use model::{
    Lifetime, QuarantineRecord, QueryIdentity, Record, RecordKey, RunawayActionType,
    RunawayMatchType, RunawayWatchType, MANUAL_SOURCE,
};
pub use pipeline::RunawayPipeline;
pub use store::RunawayStore;
pub use syncer::{SyncReport, WatchSyncer};
pub use ttl_cache::{CacheObserver, EvictionReason, TtlCache};
