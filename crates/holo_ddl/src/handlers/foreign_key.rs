use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use super::{invalid_args, JobContext, JobHandler};
use crate::error::{as_ddl_error, DdlError};
use crate::foreign_key::{check_add_foreign_key_valid_in_owner, check_foreign_key_constrain};
use crate::job::{Job, JobArgs, JobState};
use crate::meta::{get_table_info_and_cancel_fault_job, update_version_and_table_info, MetaTxn};
use crate::model::{SchemaState, TableInfo};

/// `ALTER TABLE ... ADD FOREIGN KEY`: None -> WriteOnly -> WriteReorganization -> Public.
pub struct AddForeignKeyHandler;

#[async_trait]
impl JobHandler for AddForeignKeyHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::AddForeignKey { fk, fk_check } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let mut table = get_table_info_and_cancel_fault_job(ctx.txn, job)?;
        if job.is_rolling_back() {
            return drop_foreign_key(ctx.txn, job, &mut table, &fk.name);
        }

        match job.schema_state {
            SchemaState::None => {
                if let Some(existing) = table.find_foreign_key(&fk.name) {
                    if existing.state != SchemaState::Public && existing.same_definition(&fk) {
                        // Already staged by an earlier attempt of this step.
                        job.schema_state = existing.state;
                        return Ok(ctx.txn.schema_version());
                    }
                }
                let is = ctx.info_cache.get_latest();
                if let Err(err) = check_add_foreign_key_valid_in_owner(
                    ctx.config,
                    &is,
                    &job.schema_name,
                    &table,
                    &fk,
                    fk_check,
                ) {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }
                let mut fk = fk;
                fk.id = table.allocate_foreign_key_id();
                fk.state = SchemaState::WriteOnly;
                table.foreign_keys.push(fk.clone());
                job.args = JobArgs::AddForeignKey { fk, fk_check };
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::WriteOnly;
                Ok(version)
            }
            SchemaState::WriteOnly => {
                let pos = staged_position(&table, &fk.name, SchemaState::WriteOnly)?;
                if let Err(err) = check_foreign_key_constrain(
                    ctx.session_pool,
                    ctx.step,
                    &job.schema_name,
                    &table.name,
                    &table.foreign_keys[pos],
                    fk_check,
                )
                .await
                {
                    if !as_ddl_error(&err).is_some_and(DdlError::is_transient) {
                        warn!(job_id = job.id, fk = %fk.name, error = %err, "foreign key rows check failed, rolling back");
                        job.state = JobState::RollingBack;
                    }
                    return Err(err);
                }
                table.foreign_keys[pos].state = SchemaState::WriteReorganization;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::WriteReorganization;
                Ok(version)
            }
            SchemaState::WriteReorganization => {
                let pos = staged_position(&table, &fk.name, SchemaState::WriteReorganization)?;
                table.foreign_keys[pos].state = SchemaState::Public;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.finish_table_job(JobState::Done, SchemaState::Public, version, Some(&table));
                info!(job_id = job.id, fk = %fk.name, table = %table.name, "foreign key is public");
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("foreign key".to_string(), other).into()),
        }
    }
}

/// `ALTER TABLE ... DROP FOREIGN KEY`: Public -> None in one step.
pub struct DropForeignKeyHandler;

#[async_trait]
impl JobHandler for DropForeignKeyHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::DropForeignKey { fk_name } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let mut table = get_table_info_and_cancel_fault_job(ctx.txn, job)?;
        if job.is_rolling_back() {
            let version = ctx.txn.schema_version();
            job.finish_table_job(JobState::RollbackDone, SchemaState::Public, version, Some(&table));
            return Ok(version);
        }
        match job.schema_state {
            SchemaState::Public => drop_foreign_key(ctx.txn, job, &mut table, &fk_name),
            other => Err(DdlError::InvalidDdlState("foreign key".to_string(), other).into()),
        }
    }
}

fn staged_position(table: &TableInfo, fk_name: &str, expected: SchemaState) -> Result<usize> {
    match table.foreign_key_position(fk_name) {
        Some(pos) if table.foreign_keys[pos].state == expected => Ok(pos),
        Some(pos) => Err(DdlError::InvalidDdlState(
            "foreign key".to_string(),
            table.foreign_keys[pos].state,
        )
        .into()),
        None => Err(DdlError::InvalidDdlState("foreign key".to_string(), SchemaState::None).into()),
    }
}

/// Removes the constraint and finishes the job; also the undo path of an add.
fn drop_foreign_key(txn: &mut MetaTxn, job: &mut Job, table: &mut TableInfo, fk_name: &str) -> Result<i64> {
    let Some(pos) = table.foreign_key_position(fk_name) else {
        if job.is_rolling_back() {
            let version = txn.schema_version();
            job.finish_table_job(JobState::RollbackDone, SchemaState::None, version, Some(table));
            return Ok(version);
        }
        job.state = JobState::Cancelled;
        return Err(DdlError::CantDropFieldOrKey(fk_name.to_string()).into());
    };
    table.foreign_keys.remove(pos);
    let version = update_version_and_table_info(txn, job, table, true)?;
    let state = if job.is_rolling_back() {
        JobState::RollbackDone
    } else {
        JobState::Done
    };
    job.finish_table_job(state, SchemaState::None, version, Some(table));
    Ok(version)
}
