//! Runaway watch manager.
//!
//! Owns the process-local watch list (`"group/target" -> QuarantineRecord`),
//! the per-group count of live entries, and the producer side of the three
//! pipeline channels. Every send from the query path is non-blocking; a full
//! channel drops the item and bumps a counter in [`RunawayMetrics`].
//!
//! Lock order: `watch_lock` may be held while the cache fires observer hooks;
//! the hooks only take the active-group lock, never `watch_lock`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::config::RunawayConfig;
use crate::metrics::RunawayMetrics;
use crate::model::{
    watch_key, Lifetime, QuarantineRecord, QueryIdentity, Record, RunawayActionType,
    RunawayMatchType, RunawayWatchType,
};
use crate::ttl_cache::{CacheObserver, EvictionReason, TtlCache};

pub type WatchList = TtlCache<String, QuarantineRecord>;

/// Result of examining the watch list for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub action: RunawayActionType,
    pub switch_group_name: String,
    pub exceed_cause: String,
}

/// What `add_watch_list` did with an incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Inserted,
    /// A provisional entry was superseded, or a manual entry forced in.
    Replaced,
    /// The same durable entry is already cached.
    Unchanged,
    /// A different durable entry owns the key; the incoming one was routed
    /// to stale cleanup.
    Stale,
}

/// Receiving ends of the pipeline channels, consumed by
/// [`RunawayPipeline::spawn`](crate::pipeline::RunawayPipeline::spawn).
pub struct RunawayChannels {
    pub record_rx: mpsc::Receiver<Record>,
    pub quarantine_rx: mpsc::Receiver<QuarantineRecord>,
    pub stale_rx: mpsc::Receiver<QuarantineRecord>,
}

/// Producer for the stale-cleanup channel, shared with the eviction hook.
#[derive(Clone)]
struct StaleSink {
    tx: mpsc::Sender<QuarantineRecord>,
    metrics: Arc<RunawayMetrics>,
}

impl StaleSink {
    fn send(&self, record: QuarantineRecord) {
        if !record.is_durable() {
            // Nothing was persisted for a provisional entry.
            return;
        }
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.metrics.record_stale_dropped();
                warn!(id = record.id, key = %record.record_key(), "stale watch channel full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_stale_dropped();
            }
        }
    }
}

/// Keeps `active_groups` in step with physical cache entries.
struct WatchObserver {
    active_groups: Arc<Mutex<HashMap<String, i64>>>,
    stale: StaleSink,
}

impl CacheObserver<String, QuarantineRecord> for WatchObserver {
    fn on_insert(&self, _key: &String, value: &QuarantineRecord) {
        let mut groups = self
            .active_groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *groups.entry(value.resource_group_name.clone()).or_insert(0) += 1;
    }

    fn on_evict(&self, key: &String, value: &QuarantineRecord, reason: EvictionReason) {
        {
            let mut groups = self
                .active_groups
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match groups.get_mut(&value.resource_group_name) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    groups.remove(&value.resource_group_name);
                }
                None => {
                    warn!(key = %key, "evicted watch had no active group count");
                }
            }
        }
        // A delete means the row already left the watch table.
        if reason != EvictionReason::Deleted {
            self.stale.send(value.clone());
        }
    }
}

pub struct RunawayManager {
    config: Arc<RunawayConfig>,
    watch_list: Arc<WatchList>,
    // Serializes check-then-act decisions on the watch list.
    watch_lock: Mutex<()>,
    active_groups: Arc<Mutex<HashMap<String, i64>>>,
    record_tx: mpsc::Sender<Record>,
    quarantine_tx: mpsc::Sender<QuarantineRecord>,
    stale: StaleSink,
    metrics: Arc<RunawayMetrics>,
}

impl RunawayManager {
    pub fn new(config: Arc<RunawayConfig>) -> (Self, RunawayChannels) {
        let capacity = config.record_channel_capacity.max(1);
        let (record_tx, record_rx) = mpsc::channel(capacity);
        let (quarantine_tx, quarantine_rx) = mpsc::channel(capacity);
        let (stale_tx, stale_rx) = mpsc::channel(capacity);
        let metrics = Arc::new(RunawayMetrics::default());
        let active_groups = Arc::new(Mutex::new(HashMap::new()));
        let stale = StaleSink {
            tx: stale_tx,
            metrics: metrics.clone(),
        };
        let observer: Arc<dyn CacheObserver<String, QuarantineRecord>> = Arc::new(WatchObserver {
            active_groups: active_groups.clone(),
            stale: stale.clone(),
        });
        let watch_list = Arc::new(TtlCache::new(config.watch_list_capacity, Some(observer)));
        let manager = Self {
            config,
            watch_list,
            watch_lock: Mutex::new(()),
            active_groups,
            record_tx,
            quarantine_tx,
            stale,
            metrics,
        };
        let channels = RunawayChannels {
            record_rx,
            quarantine_rx,
            stale_rx,
        };
        (manager, channels)
    }

    pub fn config(&self) -> &RunawayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RunawayMetrics> {
        &self.metrics
    }

    pub fn watch_list(&self) -> &Arc<WatchList> {
        &self.watch_list
    }

    /// Queues a runaway record for the flush loop.
    pub fn mark_runaway(
        &self,
        query: &QueryIdentity,
        action: RunawayActionType,
        match_type: RunawayMatchType,
        now: SystemTime,
        exceed_cause: &str,
    ) {
        let record = Record {
            resource_group_name: query.resource_group_name.clone(),
            start_time: now,
            match_type,
            action,
            sample_text: query.original_sql.clone(),
            sql_digest: query.sql_digest.clone(),
            plan_digest: query.plan_digest.clone(),
            source: self.config.server_id.clone(),
            exceed_cause: exceed_cause.to_string(),
            repeats: 1,
        };
        if self.record_tx.try_send(record).is_err() {
            self.metrics.record_record_dropped();
        }
    }

    /// Watches `watch_text` locally right away and queues the entry for
    /// persistence. `ttl` of zero never expires.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_quarantine(
        &self,
        resource_group_name: &str,
        watch_text: &str,
        watch: RunawayWatchType,
        action: RunawayActionType,
        switch_group_name: &str,
        ttl: Duration,
        now: SystemTime,
        exceed_cause: &str,
    ) {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        let record = QuarantineRecord {
            id: 0,
            resource_group_name: resource_group_name.to_string(),
            start_time: now,
            end_time: ttl.map(|ttl| now + ttl),
            watch,
            watch_text: watch_text.to_string(),
            source: self.config.server_id.clone(),
            action,
            switch_group_name: switch_group_name.to_string(),
            exceed_cause: exceed_cause.to_string(),
        };
        {
            let key = record.record_key();
            let _guard = self.lock_watch();
            if self.watch_list.get(&key).is_some_and(|existing| existing.is_durable()) {
                self.watch_list.remove(&key, EvictionReason::Superseded);
            }
            self.watch_list.set(key, record.clone(), ttl);
        }
        match self.quarantine_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.metrics.record_quarantine_dropped();
                debug!(key = %record.record_key(), "quarantine channel full, dropping");
            }
            Err(TrySendError::Closed(_)) => self.metrics.record_quarantine_dropped(),
        }
    }

    /// Applies a watch row loaded from storage.
    ///
    /// Rows that already ended go straight to stale cleanup. Manual rows
    /// replace whatever is cached for their key.
    pub fn add_watch(&self, record: QuarantineRecord) -> WatchOutcome {
        let ttl = match record.lifetime(SystemTime::now()) {
            Lifetime::Ended => {
                self.stale.send(record);
                return WatchOutcome::Stale;
            }
            Lifetime::Unbounded => None,
            Lifetime::Remaining(left) => Some(left),
        };
        let force = record.is_manual();
        self.add_watch_list(record, ttl, force)
    }

    /// Inserts `record` unless a different durable entry already owns its key.
    pub fn add_watch_list(
        &self,
        record: QuarantineRecord,
        ttl: Option<Duration>,
        force: bool,
    ) -> WatchOutcome {
        let key = record.record_key();
        let _guard = self.lock_watch();
        let existing = self.watch_list.get(&key);
        if force {
            if existing.as_ref().is_some_and(|existing| existing.id == record.id) {
                return WatchOutcome::Unchanged;
            }
            // Remove first so the observer sees the old entry leave.
            let existed = self.watch_list.remove(&key, EvictionReason::Superseded).is_some();
            self.watch_list.set(key, record, ttl);
            return if existed {
                WatchOutcome::Replaced
            } else {
                WatchOutcome::Inserted
            };
        }
        match existing {
            None => {
                self.watch_list.set(key, record, ttl);
                WatchOutcome::Inserted
            }
            Some(existing) if existing.id == record.id => WatchOutcome::Unchanged,
            Some(existing) if !existing.is_durable() => {
                self.watch_list.set(key, record, ttl);
                WatchOutcome::Replaced
            }
            Some(existing) => {
                debug!(
                    key = %key,
                    cached_id = existing.id,
                    incoming_id = record.id,
                    "watch key owned by another record, routing incoming to cleanup"
                );
                self.stale.send(record);
                WatchOutcome::Stale
            }
        }
    }

    /// Removes the cached entry for `record` if it is still the same row.
    pub fn remove_watch(&self, record: &QuarantineRecord) -> bool {
        let key = record.record_key();
        let _guard = self.lock_watch();
        match self.watch_list.get(&key) {
            Some(existing) if existing.id == record.id => {
                self.watch_list.delete(&key);
                true
            }
            _ => false,
        }
    }

    /// Looks up `group/convict` on the query path.
    pub fn examine_watch_list(&self, resource_group_name: &str, convict: &str) -> Option<WatchHit> {
        let record = self.watch_record(resource_group_name, convict)?;
        Some(WatchHit {
            action: record.action,
            switch_group_name: record.switch_group_name,
            exceed_cause: record.exceed_cause,
        })
    }

    pub fn watch_record(&self, resource_group_name: &str, watch_text: &str) -> Option<QuarantineRecord> {
        let _guard = self.lock_watch();
        self.watch_list.get(&watch_key(resource_group_name, watch_text))
    }

    /// Number of live watch entries for `resource_group_name`.
    pub fn active_group(&self, resource_group_name: &str) -> i64 {
        self.active_groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(resource_group_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn active_groups(&self) -> HashMap<String, i64> {
        self.active_groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_watch(&self) -> std::sync::MutexGuard<'_, ()> {
        self.watch_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MANUAL_SOURCE;

    fn manager() -> (RunawayManager, RunawayChannels) {
        RunawayManager::new(Arc::new(RunawayConfig::default()))
    }

    fn durable(id: i64, group: &str, text: &str) -> QuarantineRecord {
        QuarantineRecord {
            id,
            resource_group_name: group.into(),
            start_time: SystemTime::now(),
            end_time: None,
            watch: RunawayWatchType::Exact,
            watch_text: text.into(),
            source: "node-2".into(),
            action: RunawayActionType::CoolDown,
            switch_group_name: String::new(),
            exceed_cause: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_is_visible_immediately() {
        let (m, mut channels) = manager();
        m.mark_quarantine(
            "rg1",
            "select * from t",
            RunawayWatchType::Exact,
            RunawayActionType::Kill,
            "",
            Duration::from_secs(10),
            SystemTime::now(),
            "exceeded max duration",
        );
        assert_eq!(
            m.examine_watch_list("rg1", "select * from t"),
            Some(WatchHit {
                action: RunawayActionType::Kill,
                switch_group_name: String::new(),
                exceed_cause: "exceeded max duration".into(),
            })
        );
        assert_eq!(m.examine_watch_list("rg2", "select * from t"), None);
        let queued = channels.quarantine_rx.try_recv().unwrap();
        assert_eq!(queued.id, 0);
        assert_eq!(m.active_group("rg1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_supersedes_provisional_without_recount() {
        let (m, mut channels) = manager();
        m.mark_quarantine(
            "rg1",
            "q",
            RunawayWatchType::Exact,
            RunawayActionType::CoolDown,
            "",
            Duration::ZERO,
            SystemTime::now(),
            "",
        );
        assert_eq!(m.add_watch(durable(9, "rg1", "q")), WatchOutcome::Replaced);
        assert_eq!(m.watch_record("rg1", "q").unwrap().id, 9);
        assert_eq!(m.active_group("rg1"), 1);

        assert_eq!(m.add_watch(durable(9, "rg1", "q")), WatchOutcome::Unchanged);
        assert_eq!(m.add_watch(durable(11, "rg1", "q")), WatchOutcome::Stale);
        assert_eq!(m.watch_record("rg1", "q").unwrap().id, 9);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_watch_replaces_durable_entry() {
        let (m, mut channels) = manager();
        m.add_watch(durable(3, "rg1", "q"));
        let mut manual = durable(4, "rg1", "q");
        manual.source = MANUAL_SOURCE.into();
        assert_eq!(m.add_watch(manual.clone()), WatchOutcome::Replaced);
        assert_eq!(m.watch_record("rg1", "q").unwrap().id, 4);
        assert_eq!(m.active_group("rg1"), 1);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 3);

        // Seeing the same manual row again changes nothing.
        assert_eq!(m.add_watch(manual), WatchOutcome::Unchanged);
        assert!(channels.stale_rx.try_recv().is_err());
        assert_eq!(m.active_group("rg1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_eviction_routes_durable_entry_to_cleanup() {
        let config = RunawayConfig {
            watch_list_capacity: 1,
            ..RunawayConfig::default()
        };
        let (m, mut channels) = RunawayManager::new(Arc::new(config));
        m.add_watch(durable(3, "rg1", "a"));
        assert_eq!(m.add_watch(durable(5, "rg1", "b")), WatchOutcome::Inserted);
        assert_eq!(m.watch_record("rg1", "a"), None);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 3);
        assert_eq!(m.active_group("rg1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_quarantine_over_durable_entry_retires_the_row() {
        let (m, mut channels) = manager();
        m.add_watch(durable(3, "rg1", "q"));
        m.mark_quarantine(
            "rg1",
            "q",
            RunawayWatchType::Exact,
            RunawayActionType::Kill,
            "",
            Duration::ZERO,
            SystemTime::now(),
            "",
        );
        assert_eq!(m.watch_record("rg1", "q").unwrap().id, 0);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 3);
        assert_eq!(m.active_group("rg1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_rows_go_to_cleanup_without_caching() {
        let (m, mut channels) = manager();
        let mut ended = durable(5, "rg1", "q");
        ended.end_time = Some(SystemTime::now() - Duration::from_secs(1));
        assert_eq!(m.add_watch(ended), WatchOutcome::Stale);
        assert_eq!(m.watch_record("rg1", "q"), None);
        assert_eq!(m.active_group("rg1"), 0);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_watch_checks_the_record_id() {
        let (m, _channels) = manager();
        m.add_watch(durable(3, "rg1", "q"));
        assert!(!m.remove_watch(&durable(2, "rg1", "q")));
        assert!(m.remove_watch(&durable(3, "rg1", "q")));
        assert_eq!(m.active_group("rg1"), 0);
        assert!(m.active_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_watch_is_not_cleaned_up_again() {
        let (m, mut channels) = manager();
        m.add_watch(durable(3, "rg1", "q"));
        assert!(m.remove_watch(&durable(3, "rg1", "q")));
        assert!(channels.stale_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_routes_only_durable_entries_to_cleanup() {
        let (m, mut channels) = manager();
        let now = SystemTime::now();
        m.mark_quarantine(
            "rg1",
            "provisional",
            RunawayWatchType::Exact,
            RunawayActionType::Kill,
            "",
            Duration::from_secs(10),
            now,
            "",
        );
        let mut persisted = durable(8, "rg1", "persisted");
        persisted.end_time = Some(now + Duration::from_secs(10));
        m.add_watch(persisted);
        assert_eq!(m.active_group("rg1"), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(m.watch_list().purge_expired(), 2);
        assert_eq!(m.active_group("rg1"), 0);
        assert_eq!(channels.stale_rx.try_recv().unwrap().id, 8);
        assert!(channels.stale_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_record_channel_counts_drops() {
        let config = RunawayConfig {
            record_channel_capacity: 2,
            ..RunawayConfig::default()
        };
        let (m, _channels) = RunawayManager::new(Arc::new(config));
        let query = QueryIdentity {
            resource_group_name: "rg1".into(),
            ..QueryIdentity::default()
        };
        for _ in 0..5 {
            m.mark_runaway(
                &query,
                RunawayActionType::DryRun,
                RunawayMatchType::Identify,
                SystemTime::now(),
                "",
            );
        }
        assert_eq!(m.metrics().snapshot().records_dropped, 3);
    }
}
