#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use holo_ddl::{
    ColumnInfo, DdlConfig, DdlContext, FieldType, IndexInfo, Job, JobArgs, MetaStore, SchemaState,
    StaticOwner, TableInfo,
};
use holo_session::scripted::ScriptedPool;

pub const SCHEMA: &str = "test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `parent(id BIGINT PRIMARY KEY, b INT, KEY idx_b (b))`
pub fn parent_table() -> TableInfo {
    TableInfo::new("parent")
        .with_column(ColumnInfo::new("id", FieldType::bigint()))
        .with_column(ColumnInfo::new("b", FieldType::int()))
        .with_handle_primary_key("id")
        .with_index(IndexInfo::new("idx_b", &["b"]))
}

/// `parent(id BIGINT PRIMARY KEY, b INT)` without an index on `b`.
pub fn unindexed_parent_table() -> TableInfo {
    TableInfo::new("parent")
        .with_column(ColumnInfo::new("id", FieldType::bigint()))
        .with_column(ColumnInfo::new("b", FieldType::int()))
        .with_handle_primary_key("id")
}

/// `child(id BIGINT PRIMARY KEY, a INT, note VARCHAR(32), KEY idx_a (a))`
pub fn child_table() -> TableInfo {
    TableInfo::new("child")
        .with_column(ColumnInfo::new("id", FieldType::bigint()))
        .with_column(ColumnInfo::new("a", FieldType::int()))
        .with_column(ColumnInfo::new("note", FieldType::varchar(32)))
        .with_handle_primary_key("id")
        .with_index(IndexInfo::new("idx_a", &["a"]))
}

/// Owner-side fixture without a background worker; steps run on demand.
pub struct StepHarness {
    pub ctx: Arc<DdlContext>,
    pub pool: ScriptedPool,
    pub owner: Arc<StaticOwner>,
    pub schema_id: i64,
}

impl StepHarness {
    pub fn new(config: DdlConfig) -> Result<Self> {
        let store = MetaStore::in_memory();
        let schema_id = store.create_schema(SCHEMA)?;
        let pool = ScriptedPool::empty();
        let owner = Arc::new(StaticOwner::new(true));
        let ctx = Arc::new(DdlContext::new(
            store,
            Arc::new(config),
            Arc::new(pool.clone()),
            owner.clone(),
        ));
        Ok(Self {
            ctx,
            pool,
            owner,
            schema_id,
        })
    }

    /// Writes a public table straight into the store.
    pub fn install_table(&self, table: TableInfo) -> Result<i64> {
        let mut txn = self.ctx.store.begin();
        let mut table = table;
        table.id = txn.gen_global_id();
        table.state = SchemaState::Public;
        for fk in &mut table.foreign_keys {
            fk.state = SchemaState::Public;
        }
        let id = table.id;
        txn.create_table(self.schema_id, table)?;
        txn.gen_schema_version();
        txn.commit().context("install table")?;
        self.ctx.info_cache.reload(&self.ctx.store);
        Ok(id)
    }

    pub fn enqueue(&self, table_id: i64, table_name: &str, args: JobArgs) -> Result<i64> {
        let mut txn = self.ctx.store.begin();
        let id = txn.enqueue_job(Job::new(self.schema_id, table_id, SCHEMA, table_name, args));
        txn.commit().context("enqueue job")?;
        Ok(id)
    }

    pub fn queued(&self, job_id: i64) -> Option<Job> {
        self.ctx.store.snapshot().jobs.get(&job_id).cloned()
    }

    pub fn history(&self, job_id: i64) -> Option<Job> {
        self.ctx.store.snapshot().history.get(&job_id).cloned()
    }

    pub fn table(&self, table_id: i64) -> Option<TableInfo> {
        self.ctx
            .store
            .snapshot()
            .tables
            .get(&self.schema_id)
            .and_then(|tables| tables.get(&table_id))
            .cloned()
    }

    pub fn schema_version(&self) -> i64 {
        self.ctx.store.snapshot().schema_version
    }
}
