//! Owner-driven job execution.
//!
//! Only the elected owner runs job steps. The worker takes the oldest queued
//! job, runs one step through its handler inside a fresh metadata
//! transaction and commits the table change together with the job record.
//! A failed step discards its transaction; the job alone is then persisted
//! with the error so the next round can retry, roll back or finish it.

use std::sync::Arc;

use anyhow::{Context, Result};
use holo_session::SessionPool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DdlConfig;
use crate::error::{as_ddl_error, to_persisted_error, DdlError};
use crate::handlers::{HandlerRegistry, JobContext, StepContext};
use crate::infoschema::InfoCache;
use crate::job::{FinishedInfo, Job, JobState};
use crate::meta::{MetaStore, MetaTxn};

/// Version of the internal job tables this engine expects.
pub const CURRENT_DDL_TABLE_VERSION: i64 = 1;

/// Leadership capability supplied by the embedding process.
pub trait OwnerManager: Send + Sync {
    fn is_owner(&self) -> bool;
    /// Receiver that flips to `false` when leadership is lost.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Owner flag set explicitly by the embedder.
#[derive(Debug)]
pub struct StaticOwner {
    tx: watch::Sender<bool>,
}

impl StaticOwner {
    pub fn new(is_owner: bool) -> Self {
        let (tx, _rx) = watch::channel(is_owner);
        Self { tx }
    }

    pub fn set_owner(&self, is_owner: bool) {
        self.tx.send_replace(is_owner);
    }
}

impl OwnerManager for StaticOwner {
    fn is_owner(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// State shared by the worker and statement submitters.
pub struct DdlContext {
    pub store: MetaStore,
    pub info_cache: Arc<InfoCache>,
    pub config: Arc<DdlConfig>,
    pub session_pool: Arc<dyn SessionPool>,
    pub owner: Arc<dyn OwnerManager>,
    job_added: Notify,
    job_finished: Notify,
}

impl DdlContext {
    pub fn new(
        store: MetaStore,
        config: Arc<DdlConfig>,
        session_pool: Arc<dyn SessionPool>,
        owner: Arc<dyn OwnerManager>,
    ) -> Self {
        let info_cache = Arc::new(InfoCache::new(&store));
        Self {
            store,
            info_cache,
            config,
            session_pool,
            owner,
            job_added: Notify::new(),
            job_finished: Notify::new(),
        }
    }

    /// Wakes the worker after a job was enqueued.
    pub fn notify_job_added(&self) {
        self.job_added.notify_one();
    }

    /// Waits until job `job_id` is archived and returns its final record.
    pub async fn wait_job_done(&self, job_id: i64) -> Job {
        loop {
            let notified = self.job_finished.notified();
            tokio::pin!(notified);
            // Decision: register before checking history so a finish between
            // the check and the await is not missed.
            notified.as_mut().enable();
            if let Some(job) = self.store.snapshot().history.get(&job_id) {
                return job.clone();
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.job_poll_interval) => {}
            }
        }
    }
}

/// Handle to the running job worker.
pub struct DdlScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DdlScheduler {
    pub fn spawn(ctx: Arc<DdlContext>, handlers: HandlerRegistry) -> Result<Self> {
        ensure_ddl_table_version(&ctx.store)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(ctx, handlers, shutdown_rx));
        Ok(Self { shutdown_tx, handle })
    }

    /// Stops the worker after its current step and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(error = %err, "ddl worker task failed");
        }
    }
}

fn ensure_ddl_table_version(store: &MetaStore) -> Result<()> {
    let mut txn = store.begin();
    let current = txn.ddl_table_version();
    if current >= CURRENT_DDL_TABLE_VERSION {
        return Ok(());
    }
    txn.set_ddl_table_version(CURRENT_DDL_TABLE_VERSION);
    txn.commit().context("upgrade ddl table version")?;
    info!(from = current, to = CURRENT_DDL_TABLE_VERSION, "ddl table version upgraded");
    Ok(())
}

async fn run_worker(ctx: Arc<DdlContext>, handlers: HandlerRegistry, mut shutdown_rx: watch::Receiver<bool>) {
    info!("ddl worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let mut progressed = false;
        if ctx.owner.is_owner() {
            match run_one_step(&ctx, &handlers).await {
                Ok(ran) => progressed = ran,
                Err(err) => warn!(error = %err, "ddl job round failed"),
            }
        }
        if progressed {
            continue;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Decision: stop once sender dropped or shutdown flag is set.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ctx.job_added.notified() => {}
            _ = tokio::time::sleep(ctx.config.job_poll_interval) => {}
        }
    }
    info!("ddl worker stopped");
}

/// Runs one step of the oldest queued job. Returns whether a job was found.
pub async fn run_one_step(ctx: &DdlContext, handlers: &HandlerRegistry) -> Result<bool> {
    let mut txn = ctx.store.begin();
    let Some(mut job) = txn.first_queued_job() else {
        return Ok(false);
    };
    let handler = handlers.get(job.job_type)?;
    if job.state == JobState::Queued {
        job.state = JobState::Running;
    }
    let before = job.schema_state;

    let token = CancellationToken::new();
    let step = StepContext::new(token.clone());
    let monitor = spawn_owner_monitor(ctx.owner.as_ref(), token.clone());

    let outcome = {
        let mut job_ctx = JobContext {
            txn: &mut txn,
            info_cache: ctx.info_cache.as_ref(),
            config: ctx.config.as_ref(),
            session_pool: ctx.session_pool.as_ref(),
            step: &step,
        };
        handler.run_step(&mut job_ctx, &mut job).await
    };
    let outcome = outcome.and_then(|version| {
        if job.job_type.is_valid_transition(before, job.schema_state, job.state) {
            Ok(version)
        } else {
            error!(job = %job, from = %before, "handler produced an out-of-order schema state");
            let state = job.schema_state;
            job.schema_state = before;
            Err(DdlError::InvalidDdlState(format!("{} job", job.job_type), state).into())
        }
    });
    monitor.abort();

    match outcome {
        Ok(version) => {
            if step.is_cancelled() || !ctx.owner.is_owner() {
                info!(job_id = job.id, "ownership lost, abandoning step");
                return Ok(true);
            }
            job.schema_version = version;
            if job.is_done() {
                job.error = None;
            }
            persist_job(&mut txn, &job)?;
            if !commit_step(txn, &job, "commit step")? {
                return Ok(true);
            }
            debug!(job = %job, version, "ddl job step committed");
        }
        Err(err) => {
            drop(txn);
            if as_ddl_error(&err).is_some_and(DdlError::is_transient) {
                info!(job_id = job.id, error = %err, "ddl job step abandoned");
                return Ok(true);
            }
            handle_step_error(ctx, &mut job, &err);
            let mut txn = ctx.store.begin();
            persist_job(&mut txn, &job)?;
            if !commit_step(txn, &job, "persist failed job")? {
                return Ok(true);
            }
        }
    }

    ctx.info_cache.reload(&ctx.store);
    if job.is_finished() {
        info!(job = %job, "ddl job finished");
        ctx.job_finished.notify_waiters();
    }
    Ok(true)
}

/// Commits a step's transaction. A write conflict abandons the step so the
/// job is picked up again from the newer snapshot on the next round.
fn commit_step(txn: MetaTxn, job: &Job, what: &str) -> Result<bool> {
    match txn.commit() {
        Ok(_) => Ok(true),
        Err(err) if as_ddl_error(&err).is_some_and(DdlError::is_transient) => {
            info!(job_id = job.id, step = what, error = %err, "ddl job step abandoned after write conflict");
            Ok(false)
        }
        Err(err) => Err(err.context(format!("{what} of job {}", job.id))),
    }
}

fn handle_step_error(ctx: &DdlContext, job: &mut Job, err: &anyhow::Error) {
    let typed = to_persisted_error(err);
    match job.state {
        JobState::Cancelled => {
            info!(job_id = job.id, error = %typed, "ddl job cancelled");
        }
        JobState::RollingBack => {
            warn!(job_id = job.id, error = %typed, "ddl job rolling back");
        }
        _ => {
            job.error_count += 1;
            let invalid_state = matches!(typed, DdlError::InvalidDdlState(..));
            if invalid_state || job.error_count > ctx.config.error_count_limit {
                warn!(
                    job_id = job.id,
                    error_count = job.error_count,
                    error = %typed,
                    "ddl job cannot make progress, converting to rollback"
                );
                job.convert_to_rollback();
            } else {
                warn!(job_id = job.id, error_count = job.error_count, error = %typed, "ddl job step failed, will retry");
            }
        }
    }
    job.error = Some(typed);
    if job.state == JobState::Cancelled && job.finished.is_none() {
        job.finished = Some(FinishedInfo {
            schema_version: job.schema_version,
            table: None,
        });
    }
}

fn persist_job(txn: &mut MetaTxn, job: &Job) -> Result<()> {
    if job.is_finished() {
        txn.finish_job(job)
    } else {
        txn.update_job(job)
    }
}

fn spawn_owner_monitor(owner: &dyn OwnerManager, token: CancellationToken) -> JoinHandle<()> {
    if !owner.is_owner() {
        token.cancel();
    }
    let mut owner_rx = owner.subscribe();
    tokio::spawn(async move {
        loop {
            if !*owner_rx.borrow_and_update() {
                token.cancel();
                return;
            }
            if owner_rx.changed().await.is_err() {
                return;
            }
        }
    })
}
