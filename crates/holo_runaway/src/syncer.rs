//! Reconciles the local watch list with the persisted watch tables.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use anyhow::Result;
use tracing::{debug, info};

use crate::manager::{RunawayManager, WatchOutcome};
use crate::model::QuarantineRecord;
use crate::store::{RunawayStore, RUNAWAY_WATCH_DONE_TABLE, RUNAWAY_WATCH_TABLE};

/// Outcome of one sync round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// False while the watch tables have not been created yet.
    pub ready: bool,
    pub added: usize,
    pub removed: usize,
}

pub struct WatchSyncer {
    store: RunawayStore,
    tables_ready: AtomicBool,
    // Highest row id applied from each table.
    last_watch_id: AtomicI64,
    last_done_id: AtomicI64,
}

impl WatchSyncer {
    pub fn new(store: RunawayStore) -> Self {
        Self {
            store,
            tables_ready: AtomicBool::new(false),
            last_watch_id: AtomicI64::new(0),
            last_done_id: AtomicI64::new(0),
        }
    }

    /// Both watch tables exist. Cached once true.
    pub async fn tables_ready(&self) -> Result<bool> {
        if self.tables_ready.load(Ordering::Acquire) {
            return Ok(true);
        }
        for table in [RUNAWAY_WATCH_TABLE, RUNAWAY_WATCH_DONE_TABLE] {
            if !self.store.system_table_exists(table).await? {
                return Ok(false);
            }
        }
        self.tables_ready.store(true, Ordering::Release);
        info!("runaway watch tables are ready");
        Ok(true)
    }

    /// Watch rows not yet applied, in id order.
    pub async fn fetch_new_watches(&self) -> Result<Vec<QuarantineRecord>> {
        let after = self.last_watch_id.load(Ordering::Acquire);
        let rows: Vec<QuarantineRecord> = self
            .store
            .watches_after(after)
            .await?
            .into_iter()
            .filter(|record| record.id > after)
            .collect();
        if let Some(last) = rows.iter().map(|record| record.id).max() {
            self.last_watch_id.fetch_max(last, Ordering::AcqRel);
        }
        Ok(rows)
    }

    /// Done rows not yet applied; each record carries the id of the watch
    /// row it replaced.
    pub async fn fetch_done_watches(&self) -> Result<Vec<QuarantineRecord>> {
        let after = self.last_done_id.load(Ordering::Acquire);
        let rows: Vec<(QuarantineRecord, i64)> = self
            .store
            .done_watches_after(after)
            .await?
            .into_iter()
            .filter(|(_, done_id)| *done_id > after)
            .collect();
        if let Some(last) = rows.iter().map(|(_, done_id)| *done_id).max() {
            self.last_done_id.fetch_max(last, Ordering::AcqRel);
        }
        Ok(rows.into_iter().map(|(record, _)| record).collect())
    }

    /// Applies new watch rows, then removes entries whose rows are done.
    pub async fn sync(&self, manager: &RunawayManager) -> Result<SyncReport> {
        if !self.tables_ready().await? {
            return Ok(SyncReport::default());
        }
        let mut report = SyncReport {
            ready: true,
            ..SyncReport::default()
        };
        for record in self.fetch_new_watches().await? {
            let id = record.id;
            match manager.add_watch(record) {
                WatchOutcome::Inserted | WatchOutcome::Replaced => {
                    manager.metrics().record_watch_synced();
                    report.added += 1;
                }
                outcome => debug!(id, ?outcome, "synced watch not applied"),
            }
        }
        for record in self.fetch_done_watches().await? {
            if manager.remove_watch(&record) {
                report.removed += 1;
            }
        }
        Ok(report)
    }
}
