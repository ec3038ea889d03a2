//! Statement-level entry points.
//!
//! Each statement runs the cheap definition checks against the session's
//! latest schema, queues a job and blocks until the owner archives it. The
//! owner repeats every check authoritatively, so a statement that passes here
//! may still fail once its job runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use holo_session::SessionPool;
use tracing::{debug, info};

use crate::config::DdlConfig;
use crate::error::{as_ddl_error, DdlError};
use crate::foreign_key::check_add_foreign_key_valid;
use crate::handlers::HandlerRegistry;
use crate::job::{Job, JobArgs, JobState};
use crate::meta::{MetaStore, MetaTxn};
use crate::model::{ForeignKeyInfo, TableInfo};
use crate::scheduler::{DdlContext, DdlScheduler, OwnerManager};

const SUBMIT_RETRY_LIMIT: usize = 16;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(10);
const SUBMIT_RETRY_MAX_DELAY: Duration = Duration::from_millis(200);
const SUBMIT_RETRY_MAX_ELAPSED: Duration = Duration::from_secs(5);

/// Schema-change engine: job worker plus the statement API.
pub struct Ddl {
    ctx: Arc<DdlContext>,
    scheduler: DdlScheduler,
}

impl Ddl {
    pub fn start(
        store: MetaStore,
        config: Arc<DdlConfig>,
        session_pool: Arc<dyn SessionPool>,
        owner: Arc<dyn OwnerManager>,
    ) -> Result<Self> {
        Self::start_with_handlers(store, config, session_pool, owner, HandlerRegistry::with_defaults())
    }

    pub fn start_with_handlers(
        store: MetaStore,
        config: Arc<DdlConfig>,
        session_pool: Arc<dyn SessionPool>,
        owner: Arc<dyn OwnerManager>,
        handlers: HandlerRegistry,
    ) -> Result<Self> {
        let ctx = Arc::new(DdlContext::new(store, config, session_pool, owner));
        let scheduler = DdlScheduler::spawn(ctx.clone(), handlers).context("start ddl worker")?;
        info!("ddl engine started");
        Ok(Self { ctx, scheduler })
    }

    pub fn context(&self) -> &Arc<DdlContext> {
        &self.ctx
    }

    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
    }

    pub async fn create_table(&self, schema: &str, table: TableInfo, fk_check: bool) -> Result<Job> {
        let is = self.ctx.info_cache.get_latest();
        let schema_info = is
            .schema_by_name(schema)
            .ok_or_else(|| DdlError::DatabaseNotExists(schema.to_string()))?;
        if is.table_exists(schema, &table.name) {
            return Err(DdlError::TableExists(table.name.clone()).into());
        }
        let (schema_id, schema_name, table_name) =
            (schema_info.id, schema_info.name.clone(), table.name.clone());
        self.submit(move |txn| {
            let table_id = txn.gen_global_id();
            Job::new(
                schema_id,
                table_id,
                &schema_name,
                &table_name,
                JobArgs::CreateTable {
                    table: table.clone(),
                    fk_check,
                },
            )
        })
        .await
    }

    pub async fn add_foreign_key(
        &self,
        schema: &str,
        table: &str,
        fk: ForeignKeyInfo,
        fk_check: bool,
    ) -> Result<Job> {
        let is = self.ctx.info_cache.get_latest();
        let (schema_id, target) = self.resolve_table(schema, table)?;
        check_add_foreign_key_valid(&self.ctx.config, &is, schema, &target, &fk, fk_check)?;
        let args = JobArgs::AddForeignKey { fk, fk_check };
        self.submit_for(schema_id, &target, schema, args).await
    }

    pub async fn drop_foreign_key(&self, schema: &str, table: &str, fk_name: &str) -> Result<Job> {
        let (schema_id, target) = self.resolve_table(schema, table)?;
        if target.find_foreign_key(fk_name).is_none() {
            return Err(DdlError::CantDropFieldOrKey(fk_name.to_string()).into());
        }
        let args = JobArgs::DropForeignKey {
            fk_name: fk_name.to_string(),
        };
        self.submit_for(schema_id, &target, schema, args).await
    }

    pub async fn drop_table(&self, schema: &str, table: &str, fk_check: bool) -> Result<Job> {
        let (schema_id, target) = self.resolve_table(schema, table)?;
        self.submit_for(schema_id, &target, schema, JobArgs::DropTable { fk_check })
            .await
    }

    pub async fn truncate_table(&self, schema: &str, table: &str, fk_check: bool) -> Result<Job> {
        let (schema_id, target) = self.resolve_table(schema, table)?;
        let (table_id, table_name) = (target.id, target.name.clone());
        let schema_name = schema.to_string();
        self.submit(move |txn| {
            let new_table_id = txn.gen_global_id();
            Job::new(
                schema_id,
                table_id,
                &schema_name,
                &table_name,
                JobArgs::TruncateTable { new_table_id, fk_check },
            )
        })
        .await
    }

    pub async fn drop_index(&self, schema: &str, table: &str, index_name: &str) -> Result<Job> {
        let (schema_id, target) = self.resolve_table(schema, table)?;
        if target.find_index(index_name).is_none() {
            return Err(DdlError::CantDropFieldOrKey(index_name.to_string()).into());
        }
        let args = JobArgs::DropIndex {
            index_name: index_name.to_string(),
        };
        self.submit_for(schema_id, &target, schema, args).await
    }

    pub async fn drop_column(&self, schema: &str, table: &str, column_name: &str) -> Result<Job> {
        let (schema_id, target) = self.resolve_table(schema, table)?;
        if target.find_column(column_name).is_none() {
            return Err(DdlError::CantDropFieldOrKey(column_name.to_string()).into());
        }
        let args = JobArgs::DropColumn {
            column_name: column_name.to_string(),
        };
        self.submit_for(schema_id, &target, schema, args).await
    }

    fn resolve_table(&self, schema: &str, table: &str) -> Result<(i64, Arc<TableInfo>)> {
        let is = self.ctx.info_cache.get_latest();
        let schema_id = is
            .schema_by_name(schema)
            .map(|info| info.id)
            .ok_or_else(|| DdlError::DatabaseNotExists(schema.to_string()))?;
        let table = is.table_by_name(schema, table)?;
        Ok((schema_id, table))
    }

    async fn submit_for(&self, schema_id: i64, table: &TableInfo, schema: &str, args: JobArgs) -> Result<Job> {
        let (table_id, table_name, schema_name) = (table.id, table.name.clone(), schema.to_string());
        self.submit(move |_| Job::new(schema_id, table_id, &schema_name, &table_name, args.clone()))
            .await
    }

    /// Queues the job built by `build`, waits for it and maps failures to
    /// the job's recorded error.
    async fn submit<F>(&self, build: F) -> Result<Job>
    where
        F: Fn(&mut MetaTxn) -> Job,
    {
        let job_id = self.enqueue(build).await?;
        self.ctx.notify_job_added();
        let job = self.ctx.wait_job_done(job_id).await;
        debug!(job = %job, "ddl job returned to client");
        match (job.state, job.error.clone()) {
            (JobState::Done, _) => Ok(job),
            (_, Some(err)) => Err(err.into()),
            (state, None) => Err(DdlError::Internal(format!("job {} ended {state} without error", job.id)).into()),
        }
    }

    async fn enqueue<F>(&self, build: F) -> Result<i64>
    where
        F: Fn(&mut MetaTxn) -> Job,
    {
        let deadline = Instant::now() + SUBMIT_RETRY_MAX_ELAPSED;
        let mut attempt = 0;
        loop {
            let mut txn = self.ctx.store.begin();
            let job = build(&mut txn);
            let job_id = txn.enqueue_job(job);
            match txn.commit() {
                Ok(_) => return Ok(job_id),
                Err(err)
                    if matches!(as_ddl_error(&err), Some(DdlError::WriteConflict { .. }))
                        && attempt + 1 < SUBMIT_RETRY_LIMIT
                        && Instant::now() < deadline =>
                {
                    // Decision: concurrent submitters and the worker race on
                    // the same revision; back off and rebuild the job.
                    tokio::time::sleep(submit_retry_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err).context("enqueue ddl job"),
            }
        }
    }
}

fn submit_retry_delay(attempt: usize) -> Duration {
    let shift = (attempt as u32).min(5);
    let base_ms = SUBMIT_RETRY_DELAY.as_millis();
    let capped_ms = base_ms
        .saturating_mul(1u128 << shift)
        .min(SUBMIT_RETRY_MAX_DELAY.as_millis());
    Duration::from_millis(capped_ms as u64)
}
