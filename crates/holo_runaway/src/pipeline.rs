//! Background loops that persist and reconcile runaway state.
//!
//! [`RunawayPipeline::spawn`] starts one task per loop under a shared
//! shutdown signal; [`RunawayPipeline::shutdown`] signals and joins them all.
//!
//! - flush: dedups records and writes them in batches, and schedules
//!   garbage collection of old records;
//! - quarantine insert: persists locally detected watch entries;
//! - stale cleanup: moves superseded or expired watch rows to the done table;
//! - watch sync: applies rows written by other nodes;
//! - cache purge: expires watch-list entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::manager::{RunawayChannels, RunawayManager};
use crate::model::{QuarantineRecord, Record, RecordKey};
use crate::store::RunawayStore;
use crate::syncer::WatchSyncer;
use crate::ttl_cache::run_purge_loop;

/// Repeated sync failures are logged once per this many rounds.
const SYNC_ERROR_LOG_EVERY: u64 = 1800;

pub struct RunawayPipeline {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunawayPipeline {
    pub fn spawn(
        manager: Arc<RunawayManager>,
        channels: RunawayChannels,
        store: RunawayStore,
        syncer: Arc<WatchSyncer>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = manager.config().clone();
        let RunawayChannels {
            record_rx,
            quarantine_rx,
            stale_rx,
        } = channels;

        let tasks = vec![
            (
                "flush",
                tokio::spawn(run_flush_loop(
                    manager.clone(),
                    store.clone(),
                    record_rx,
                    shutdown_rx.clone(),
                )),
            ),
            (
                "quarantine-insert",
                tokio::spawn(run_quarantine_insert_loop(
                    store.clone(),
                    quarantine_rx,
                    shutdown_rx.clone(),
                )),
            ),
            (
                "stale-cleanup",
                tokio::spawn(run_stale_cleanup_loop(
                    manager.clone(),
                    store,
                    stale_rx,
                    shutdown_rx.clone(),
                )),
            ),
            (
                "watch-sync",
                tokio::spawn(run_watch_sync_loop(
                    manager.clone(),
                    syncer,
                    shutdown_rx.clone(),
                )),
            ),
            (
                "cache-purge",
                tokio::spawn(run_purge_loop(
                    manager.watch_list().clone(),
                    config.cache_purge_interval,
                    shutdown_rx,
                )),
            ),
        ];
        info!(server_id = %config.server_id, "runaway pipeline started");
        Self { shutdown_tx, tasks }
    }

    /// Signals every loop and waits for all of them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(err) = handle.await {
                warn!(task = name, error = %err, "runaway task failed");
            }
        }
        info!("runaway pipeline stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Pending records keyed for deduplication.
#[derive(Default)]
struct RecordBuffer {
    records: HashMap<RecordKey, Record>,
}

impl RecordBuffer {
    fn push(&mut self, record: Record) {
        let repeats = record.repeats;
        self.records
            .entry(record.key())
            .and_modify(|existing| existing.repeats += repeats)
            .or_insert(record);
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn take(&mut self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|record| record.start_time);
        records
    }
}

async fn flush(manager: &RunawayManager, store: &RunawayStore, buffer: &mut RecordBuffer) {
    if buffer.is_empty() {
        return;
    }
    let records = buffer.take();
    match store.flush_records(&records).await {
        Ok(rows) => {
            manager.metrics().record_flush(rows);
            debug!(rows, "runaway records flushed");
        }
        Err(err) => {
            manager.metrics().record_flush_failure();
            warn!(error = ?err, rows = records.len(), "runaway record flush failed, batch dropped");
        }
    }
}

async fn run_flush_loop(
    manager: Arc<RunawayManager>,
    store: RunawayStore,
    mut record_rx: mpsc::Receiver<Record>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let config = manager.config().clone();
    let threshold = config.flush_threshold();
    let mut buffer = RecordBuffer::default();
    let mut flush_ticker = ticker(config.flush_interval);
    let mut gc_ticker = ticker(config.gc_interval);
    let mut gc_task: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = record_rx.recv() => {
                let Some(record) = received else {
                    break;
                };
                buffer.push(record);
                if buffer.len() >= threshold {
                    flush(&manager, &store, &mut buffer).await;
                }
            }
            _ = flush_ticker.tick() => {
                flush(&manager, &store, &mut buffer).await;
            }
            _ = gc_ticker.tick() => {
                if gc_task.as_ref().is_some_and(|task| !task.is_finished()) {
                    debug!("previous runaway record gc still running, skipping");
                    continue;
                }
                let cutoff = SystemTime::now()
                    .checked_sub(config.record_retention)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                gc_task = Some(tokio::spawn(collect_garbage(
                    manager.clone(),
                    store.clone(),
                    cutoff,
                    config.gc_batch_size,
                )));
            }
        }
    }

    while let Ok(record) = record_rx.try_recv() {
        buffer.push(record);
    }
    flush(&manager, &store, &mut buffer).await;
    if let Some(task) = gc_task {
        if let Err(err) = task.await {
            warn!(error = %err, "runaway record gc task failed");
        }
    }
    info!("runaway flush loop stopped");
}

async fn collect_garbage(
    manager: Arc<RunawayManager>,
    store: RunawayStore,
    cutoff: SystemTime,
    batch_size: usize,
) {
    match store.delete_expired_records(cutoff, batch_size).await {
        Ok(rows) => {
            manager.metrics().record_garbage_collected(rows);
            info!(rows, "expired runaway records deleted");
        }
        Err(err) => warn!(error = ?err, "runaway record gc failed"),
    }
}

async fn run_quarantine_insert_loop(
    store: RunawayStore,
    mut quarantine_rx: mpsc::Receiver<QuarantineRecord>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = quarantine_rx.recv() => {
                let Some(record) = received else {
                    break;
                };
                let store = store.clone();
                inflight.spawn(async move {
                    match store.add_runaway_watch(&record).await {
                        Ok(id) => debug!(id, key = %record.record_key(), "runaway watch persisted"),
                        // Decision: no retry here; the next detection or
                        // sync round supersedes a lost insert.
                        Err(err) => warn!(error = ?err, key = %record.record_key(), "persist runaway watch failed"),
                    }
                });
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "runaway watch insert task failed");
                }
            }
        }
    }
    while let Some(joined) = inflight.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "runaway watch insert task failed");
        }
    }
    info!("runaway quarantine insert loop stopped");
}

async fn run_stale_cleanup_loop(
    manager: Arc<RunawayManager>,
    store: RunawayStore,
    mut stale_rx: mpsc::Receiver<QuarantineRecord>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let attempts = manager.config().stale_cleanup_retries.max(1);
    let backoff = manager.config().stale_cleanup_backoff;
    'outer: loop {
        let record = tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            received = stale_rx.recv() => match received {
                Some(record) => record,
                None => break,
            },
        };

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break 'outer;
                        }
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            match store.move_watch_to_done(&record, SystemTime::now()).await {
                Ok(()) => {
                    manager.metrics().record_stale_cleanup();
                    debug!(id = record.id, "stale runaway watch moved to done");
                    continue 'outer;
                }
                Err(err) => {
                    warn!(error = ?err, id = record.id, attempt, "stale runaway watch cleanup failed");
                }
            }
        }
        manager.metrics().record_stale_cleanup_failure();
        error!(id = record.id, attempts, "giving up on stale runaway watch cleanup");
    }
    info!("runaway stale cleanup loop stopped");
}

async fn run_watch_sync_loop(
    manager: Arc<RunawayManager>,
    syncer: Arc<WatchSyncer>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sync_ticker = ticker(manager.config().watch_sync_interval);
    let mut rounds: u64 = 0;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = sync_ticker.tick() => {
                let log_now = rounds % SYNC_ERROR_LOG_EVERY == 0;
                rounds = rounds.wrapping_add(1);
                match syncer.sync(&manager).await {
                    Ok(report) if !report.ready => {
                        if log_now {
                            info!("runaway watch tables not created yet, sync deferred");
                        }
                    }
                    Ok(report) => {
                        if report.added > 0 || report.removed > 0 {
                            debug!(added = report.added, removed = report.removed, "runaway watches synced");
                        }
                    }
                    Err(err) => {
                        if log_now {
                            warn!(error = ?err, rounds, "runaway watch sync failed");
                        }
                    }
                }
            }
        }
    }
    info!("runaway watch sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunawayActionType, RunawayMatchType};

    fn record(digest: &str, secs: u64) -> Record {
        Record {
            resource_group_name: "rg1".into(),
            start_time: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            match_type: RunawayMatchType::Identify,
            action: RunawayActionType::DryRun,
            sample_text: String::new(),
            sql_digest: digest.into(),
            plan_digest: String::new(),
            source: "node-1".into(),
            exceed_cause: String::new(),
            repeats: 1,
        }
    }

    #[test]
    fn buffer_counts_repeats_and_keeps_the_first_record() {
        let mut buffer = RecordBuffer::default();
        buffer.push(record("a", 1));
        buffer.push(record("a", 5));
        buffer.push(record("b", 2));
        let mut watch = record("a", 3);
        watch.match_type = RunawayMatchType::Watch;
        buffer.push(watch);
        assert_eq!(buffer.len(), 3);

        let records = buffer.take();
        assert!(buffer.is_empty());
        let identified_a = records
            .iter()
            .find(|r| r.sql_digest == "a" && r.match_type == RunawayMatchType::Identify)
            .unwrap();
        assert_eq!(identified_a.repeats, 2);
        assert_eq!(identified_a.start_time, SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        assert!(records.windows(2).all(|w| w[0].start_time <= w[1].start_time));
    }
}
