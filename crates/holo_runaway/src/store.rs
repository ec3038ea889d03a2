//! Persistence of runaway records and watch rows in the `mysql` system
//! tables, through restricted internal sessions.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use holo_session::{exec_restricted_sql, PooledSession, SessionPool, SqlValue};
use tracing::warn;

use crate::model::{QuarantineRecord, Record};

pub const RUNAWAY_QUERIES_TABLE: &str = "holo_runaway_queries";
pub const RUNAWAY_WATCH_TABLE: &str = "holo_runaway_watch";
pub const RUNAWAY_WATCH_DONE_TABLE: &str = "holo_runaway_watch_done";
const SYSTEM_SCHEMA: &str = "mysql";

const RECORD_COLUMNS: &str = "resource_group_name, start_time, match_type, action, sample_sql, \
                              sql_digest, plan_digest, source, exceed_cause, repeats";
const WATCH_COLUMNS: &str = "resource_group_name, start_time, end_time, watch, watch_text, source, \
                             action, switch_group_name, exceed_cause";

#[derive(Clone)]
pub struct RunawayStore {
    pool: Arc<dyn SessionPool>,
}

impl RunawayStore {
    pub fn new(pool: Arc<dyn SessionPool>) -> Self {
        Self { pool }
    }

    /// Writes `records` with one multi-row INSERT. Returns the rows written.
    pub async fn flush_records(&self, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let row = format!("({})", vec!["?"; 10].join(", "));
        let sql = format!(
            "INSERT INTO {SYSTEM_SCHEMA}.{RUNAWAY_QUERIES_TABLE} ({RECORD_COLUMNS}) VALUES {}",
            vec![row.as_str(); records.len()].join(", ")
        );
        let params: Vec<SqlValue> = records.iter().flat_map(Record::insert_params).collect();
        exec_restricted_sql(self.pool.as_ref(), &sql, &params)
            .await
            .with_context(|| format!("flush {} runaway records", records.len()))?;
        Ok(records.len() as u64)
    }

    /// Deletes records that started before `before`, `batch_size` rows per
    /// statement, until a statement deletes fewer rows than the batch.
    pub async fn delete_expired_records(&self, before: SystemTime, batch_size: usize) -> Result<u64> {
        // `LIMIT 0` would never come back short.
        let batch_size = batch_size.max(1);
        let sql = format!(
            "DELETE FROM {SYSTEM_SCHEMA}.{RUNAWAY_QUERIES_TABLE} WHERE start_time < ? LIMIT {batch_size}"
        );
        let mut total = 0;
        loop {
            let result = exec_restricted_sql(self.pool.as_ref(), &sql, &[before.into()])
                .await
                .context("delete expired runaway records")?;
            total += result.affected_rows;
            if result.affected_rows < batch_size as u64 {
                return Ok(total);
            }
        }
    }

    /// Inserts a watch row and returns its id.
    pub async fn add_runaway_watch(&self, record: &QuarantineRecord) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_TABLE} ({WATCH_COLUMNS}) VALUES ({})",
            vec!["?"; 9].join(", ")
        );
        let result = exec_restricted_sql(self.pool.as_ref(), &sql, &record.insert_params())
            .await
            .with_context(|| format!("add runaway watch {}", record.record_key()))?;
        let id = result
            .last_insert_id
            .ok_or_else(|| anyhow!("runaway watch insert returned no id"))?;
        i64::try_from(id).context("runaway watch id overflows i64")
    }

    /// Moves watch row `record.id` to the done table in one transaction.
    pub async fn move_watch_to_done(&self, record: &QuarantineRecord, done_time: SystemTime) -> Result<()> {
        let mut session = PooledSession::acquire(self.pool.as_ref())?;
        session.execute("BEGIN", &[]).await.context("begin stale watch cleanup")?;
        let outcome: Result<()> = async {
            let insert = format!(
                "INSERT INTO {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_DONE_TABLE} (record_id, {WATCH_COLUMNS}, done_time) \
                 SELECT id, {WATCH_COLUMNS}, ? FROM {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_TABLE} WHERE id = ?"
            );
            session
                .execute(&insert, &[done_time.into(), record.id.into()])
                .await
                .context("copy watch to done table")?;
            let delete = format!("DELETE FROM {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_TABLE} WHERE id = ?");
            session
                .execute(&delete, &[record.id.into()])
                .await
                .context("delete watch row")?;
            session.execute("COMMIT", &[]).await.context("commit stale watch cleanup")?;
            Ok(())
        }
        .await;
        if let Err(err) = &outcome {
            if let Err(rollback_err) = session.execute("ROLLBACK", &[]).await {
                warn!(id = record.id, error = %rollback_err, cause = %err, "rollback of stale watch cleanup failed");
            }
        }
        outcome.with_context(|| format!("move runaway watch {} to done", record.id))
    }

    pub async fn system_table_exists(&self, table: &str) -> Result<bool> {
        let result = exec_restricted_sql(
            self.pool.as_ref(),
            "SELECT 1 FROM information_schema.tables WHERE table_schema = ? AND table_name = ?",
            &[SYSTEM_SCHEMA.into(), table.into()],
        )
        .await
        .with_context(|| format!("check system table {table}"))?;
        Ok(!result.rows.is_empty())
    }

    /// Watch rows with an id above `after_id`, in id order.
    ///
    /// Ids come from the table's auto-increment column, so a row inserted
    /// late with an older `start_time` is still read.
    pub async fn watches_after(&self, after_id: i64) -> Result<Vec<QuarantineRecord>> {
        let sql = format!(
            "SELECT id, {WATCH_COLUMNS} FROM {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_TABLE} \
             WHERE id > ? ORDER BY id"
        );
        let result = exec_restricted_sql(self.pool.as_ref(), &sql, &[after_id.into()])
            .await
            .context("load runaway watches")?;
        result.rows.iter().map(QuarantineRecord::from_row).collect()
    }

    /// Done rows with an id above `after_id`, in id order, paired with that
    /// id. Each record carries the id of the watch row it replaced.
    pub async fn done_watches_after(&self, after_id: i64) -> Result<Vec<(QuarantineRecord, i64)>> {
        let sql = format!(
            "SELECT record_id, {WATCH_COLUMNS}, id FROM {SYSTEM_SCHEMA}.{RUNAWAY_WATCH_DONE_TABLE} \
             WHERE id > ? ORDER BY id"
        );
        let result = exec_restricted_sql(self.pool.as_ref(), &sql, &[after_id.into()])
            .await
            .context("load done runaway watches")?;
        result
            .rows
            .iter()
            .map(|row| Ok((QuarantineRecord::from_row(row)?, row.get_i64(10)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use holo_session::scripted::ScriptedPool;
    use holo_session::SqlResult;

    use super::*;
    use crate::model::{RunawayActionType, RunawayMatchType, RunawayWatchType};

    fn record(digest: &str) -> Record {
        Record {
            resource_group_name: "rg1".into(),
            start_time: SystemTime::UNIX_EPOCH,
            match_type: RunawayMatchType::Identify,
            action: RunawayActionType::Kill,
            sample_text: "select 1".into(),
            sql_digest: digest.into(),
            plan_digest: String::new(),
            source: "node-1".into(),
            exceed_cause: String::new(),
            repeats: 2,
        }
    }

    fn watch(id: i64) -> QuarantineRecord {
        QuarantineRecord {
            id,
            resource_group_name: "rg1".into(),
            start_time: SystemTime::UNIX_EPOCH,
            end_time: None,
            watch: RunawayWatchType::Exact,
            watch_text: "select 1".into(),
            source: "node-1".into(),
            action: RunawayActionType::Kill,
            switch_group_name: String::new(),
            exceed_cause: String::new(),
        }
    }

    #[tokio::test]
    async fn flush_writes_one_multi_row_insert() {
        let pool = ScriptedPool::empty();
        let store = RunawayStore::new(Arc::new(pool.clone()));
        assert_eq!(store.flush_records(&[]).await.unwrap(), 0);
        assert_eq!(store.flush_records(&[record("a"), record("b")]).await.unwrap(), 2);

        let statements = pool.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].sql.contains("VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?), (?"));
        assert_eq!(statements[0].params.len(), 20);
        assert_eq!(statements[0].params[9], SqlValue::UInt(2));
    }

    #[tokio::test]
    async fn gc_deletes_in_batches_until_short_batch() {
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let pool = ScriptedPool::new(move |_, _| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            Ok(SqlResult::affected(if n < 2 { 100 } else { 7 }))
        });
        let store = RunawayStore::new(Arc::new(pool.clone()));
        let deleted = store
            .delete_expired_records(SystemTime::UNIX_EPOCH + Duration::from_secs(1), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 207);
        assert_eq!(pool.statements_containing("LIMIT 100").len(), 3);
    }

    #[tokio::test]
    async fn zero_batch_size_still_terminates() {
        let pool = ScriptedPool::new(|_, _| Ok(SqlResult::affected(0)));
        let store = RunawayStore::new(Arc::new(pool.clone()));
        let deleted = tokio::time::timeout(
            Duration::from_secs(5),
            store.delete_expired_records(SystemTime::UNIX_EPOCH, 0),
        )
        .await
        .expect("gc loop must terminate")
        .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(pool.statements_containing("LIMIT 1").len(), 1);
    }

    #[tokio::test]
    async fn add_watch_requires_an_insert_id() {
        let pool = ScriptedPool::new(|_, _| Ok(SqlResult::inserted(42)));
        let store = RunawayStore::new(Arc::new(pool.clone()));
        assert_eq!(store.add_runaway_watch(&watch(0)).await.unwrap(), 42);

        pool.set_responder(|_, _| Ok(SqlResult::default()));
        assert!(store.add_runaway_watch(&watch(0)).await.is_err());
    }

    #[tokio::test]
    async fn failed_cleanup_rolls_back_on_the_same_session() {
        let pool = ScriptedPool::new(|sql, _| {
            if sql.starts_with("DELETE") {
                Err(anyhow!("write conflict"))
            } else {
                Ok(SqlResult::default())
            }
        });
        let store = RunawayStore::new(Arc::new(pool.clone()));
        let err = store
            .move_watch_to_done(&watch(5), SystemTime::UNIX_EPOCH)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("write conflict"));

        let sql: Vec<String> = pool.statements().into_iter().map(|stmt| stmt.sql).collect();
        assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
        assert!(sql[1].starts_with("INSERT INTO mysql.holo_runaway_watch_done"));
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!sql.iter().any(|s| s == "COMMIT"));
        assert_eq!(pool.outstanding_sessions(), 0);
    }

    #[tokio::test]
    async fn done_rows_decode_with_their_own_id() {
        let pool = ScriptedPool::new(move |_, _| {
            let mut values = vec![SqlValue::Int(5)];
            values.extend(watch(5).insert_params());
            values.push(SqlValue::Int(12));
            Ok(SqlResult::with_rows(vec![holo_session::Row::new(values)]))
        });
        let store = RunawayStore::new(Arc::new(pool.clone()));
        let rows = store.done_watches_after(11).await.unwrap();
        assert_eq!(rows, vec![(watch(5), 12)]);
        let select = &pool.statements()[0];
        assert!(select.sql.contains("WHERE id > ? ORDER BY id"));
        assert_eq!(select.params, vec![SqlValue::Int(11)]);
    }
}
