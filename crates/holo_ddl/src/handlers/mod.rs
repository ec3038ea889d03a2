//! Per-job-type step handlers.
//!
//! A handler runs exactly one schema-state transition of a job inside the
//! caller's metadata transaction and returns the resulting schema version.
//! Handlers must check [`Job::is_rolling_back`] first and take the undo path
//! when it is set.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use holo_session::SessionPool;
use tokio_util::sync::CancellationToken;

use crate::config::DdlConfig;
use crate::error::DdlError;
use crate::infoschema::InfoCache;
use crate::job::{Job, JobType};
use crate::meta::MetaTxn;

mod column;
mod foreign_key;
mod index;
mod table;

pub use column::DropColumnHandler;
pub use foreign_key::{AddForeignKeyHandler, DropForeignKeyHandler};
pub use index::DropIndexHandler;
pub use table::{CreateTableHandler, DropTableHandler, TruncateTableHandler};

/// Cancellation scope of one step. Cancelled when the owner loses leadership.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    token: CancellationToken,
}

impl StepContext {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Fails with [`DdlError::OwnerLost`] once the step was abandoned.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(DdlError::OwnerLost.into());
        }
        Ok(())
    }
}

/// Everything a handler may touch during one step.
pub struct JobContext<'a> {
    pub txn: &'a mut MetaTxn,
    pub info_cache: &'a InfoCache,
    pub config: &'a DdlConfig,
    pub session_pool: &'a dyn SessionPool,
    pub step: &'a StepContext,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Advances `job` by one schema state and returns the schema version.
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64>;
}

/// Handlers keyed by job type, complete for every [`JobType`].
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn with_defaults() -> Self {
        let handlers = JobType::ALL
            .iter()
            .map(|ty| {
                let handler: Arc<dyn JobHandler> = match ty {
                    JobType::CreateTable => Arc::new(CreateTableHandler),
                    JobType::DropTable => Arc::new(DropTableHandler),
                    JobType::TruncateTable => Arc::new(TruncateTableHandler),
                    JobType::AddForeignKey => Arc::new(AddForeignKeyHandler),
                    JobType::DropForeignKey => Arc::new(DropForeignKeyHandler),
                    JobType::DropIndex => Arc::new(DropIndexHandler),
                    JobType::DropColumn => Arc::new(DropColumnHandler),
                };
                (*ty, handler)
            })
            .collect();
        Self { handlers }
    }

    /// Replaces the handler for one job type.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or_else(|| DdlError::Internal(format!("no handler for {job_type}")).into())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub(crate) fn invalid_args(job: &Job) -> anyhow::Error {
    DdlError::InvalidJobArgs(job.job_type.to_string()).into()
}
