use anyhow::Result;
use async_trait::async_trait;

use super::{invalid_args, JobContext, JobHandler};
use crate::error::DdlError;
use crate::foreign_key::check_index_needed_in_foreign_key_in_owner;
use crate::job::{Job, JobArgs, JobState};
use crate::meta::{get_table_info_and_cancel_fault_job, update_version_and_table_info};
use crate::model::SchemaState;

/// `DROP INDEX`: Public -> WriteOnly -> DeleteOnly -> None.
pub struct DropIndexHandler;

#[async_trait]
impl JobHandler for DropIndexHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::DropIndex { index_name } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let mut table = get_table_info_and_cancel_fault_job(ctx.txn, job)?;
        let Some(pos) = table
            .indices
            .iter()
            .position(|idx| idx.name.eq_ignore_ascii_case(&index_name))
        else {
            job.state = JobState::Cancelled;
            return Err(DdlError::CantDropFieldOrKey(index_name).into());
        };

        if job.is_rolling_back() {
            let version = if table.indices[pos].state == SchemaState::Public {
                ctx.txn.schema_version()
            } else {
                table.indices[pos].state = SchemaState::Public;
                update_version_and_table_info(ctx.txn, job, &mut table, true)?
            };
            job.finish_table_job(JobState::RollbackDone, SchemaState::Public, version, Some(&table));
            return Ok(version);
        }

        match job.schema_state {
            SchemaState::Public => {
                let is = ctx.info_cache.get_latest();
                if let Err(err) = check_index_needed_in_foreign_key_in_owner(
                    ctx.config,
                    &is,
                    &job.schema_name,
                    &table,
                    &index_name,
                ) {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }
                table.indices[pos].state = SchemaState::WriteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::WriteOnly;
                Ok(version)
            }
            SchemaState::WriteOnly => {
                table.indices[pos].state = SchemaState::DeleteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::DeleteOnly;
                Ok(version)
            }
            SchemaState::DeleteOnly => {
                table.indices.remove(pos);
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.finish_table_job(JobState::Done, SchemaState::None, version, Some(&table));
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("index".to_string(), other).into()),
        }
    }
}
