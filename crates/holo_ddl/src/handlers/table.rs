use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{invalid_args, JobContext, JobHandler};
use crate::error::DdlError;
use crate::foreign_key::{
    check_drop_table_has_foreign_key_referred_in_owner, check_table_foreign_key_valid_in_owner,
    check_truncate_table_has_foreign_key_referred_in_owner,
};
use crate::job::{Job, JobArgs, JobState};
use crate::meta::{
    check_table_exist_and_cancel_non_exist_job, get_table_info_and_cancel_fault_job,
    update_version_and_table_info,
};
use crate::model::SchemaState;

/// `CREATE TABLE`: None -> Public in one step.
pub struct CreateTableHandler;

#[async_trait]
impl JobHandler for CreateTableHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::CreateTable { table, fk_check } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        if job.is_rolling_back() {
            let version = ctx.txn.schema_version();
            job.finish_table_job(JobState::RollbackDone, SchemaState::None, version, None);
            return Ok(version);
        }
        match job.schema_state {
            SchemaState::None => {
                if ctx.txn.get_schema(job.schema_id).is_none() {
                    job.state = JobState::Cancelled;
                    return Err(DdlError::DatabaseNotExists(job.schema_name.clone()).into());
                }
                let exists = ctx
                    .txn
                    .list_tables(job.schema_id)?
                    .iter()
                    .any(|existing| existing.name.eq_ignore_ascii_case(&table.name));
                if exists {
                    job.state = JobState::Cancelled;
                    return Err(DdlError::TableExists(table.name.clone()).into());
                }
                let is = ctx.info_cache.get_latest();
                if let Err(err) =
                    check_table_foreign_key_valid_in_owner(ctx.config, &is, &job.schema_name, &table, fk_check)
                {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }

                let mut table = table;
                table.id = job.table_id;
                table.state = SchemaState::Public;
                for fk in &mut table.foreign_keys {
                    fk.state = SchemaState::Public;
                }
                ctx.txn
                    .create_table(job.schema_id, table.clone())
                    .with_context(|| format!("create table {}", table.name))?;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.finish_table_job(JobState::Done, SchemaState::Public, version, Some(&table));
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("table".to_string(), other).into()),
        }
    }
}

/// `DROP TABLE`: Public -> WriteOnly -> DeleteOnly -> None.
pub struct DropTableHandler;

#[async_trait]
impl JobHandler for DropTableHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::DropTable { fk_check } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let mut table = check_table_exist_and_cancel_non_exist_job(ctx.txn, job)?;
        if job.is_rolling_back() {
            let version = if table.state == SchemaState::Public {
                ctx.txn.schema_version()
            } else {
                table.state = SchemaState::Public;
                update_version_and_table_info(ctx.txn, job, &mut table, true)?
            };
            job.finish_table_job(JobState::RollbackDone, SchemaState::Public, version, Some(&table));
            return Ok(version);
        }

        match job.schema_state {
            SchemaState::Public => {
                let is = ctx.info_cache.get_latest();
                if let Err(err) = check_drop_table_has_foreign_key_referred_in_owner(
                    ctx.config,
                    &is,
                    &job.schema_name,
                    &table.name,
                    fk_check,
                ) {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }
                table.state = SchemaState::WriteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::WriteOnly;
                Ok(version)
            }
            SchemaState::WriteOnly => {
                table.state = SchemaState::DeleteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::DeleteOnly;
                Ok(version)
            }
            SchemaState::DeleteOnly => {
                ctx.txn
                    .drop_table(job.schema_id, table.id)
                    .with_context(|| format!("drop table {}", table.name))?;
                let version = ctx.txn.gen_schema_version();
                table.state = SchemaState::None;
                job.finish_table_job(JobState::Done, SchemaState::None, version, Some(&table));
                info!(job_id = job.id, table = %table.name, "table dropped");
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("table".to_string(), other).into()),
        }
    }
}

/// `TRUNCATE TABLE`: replaces the table with an empty copy under a new id.
pub struct TruncateTableHandler;

#[async_trait]
impl JobHandler for TruncateTableHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::TruncateTable { new_table_id, fk_check } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let table = get_table_info_and_cancel_fault_job(ctx.txn, job)?;
        if job.is_rolling_back() {
            let version = ctx.txn.schema_version();
            job.finish_table_job(JobState::RollbackDone, SchemaState::None, version, Some(&table));
            return Ok(version);
        }
        match job.schema_state {
            SchemaState::None => {
                let is = ctx.info_cache.get_latest();
                if let Err(err) = check_truncate_table_has_foreign_key_referred_in_owner(
                    ctx.config,
                    &is,
                    &job.schema_name,
                    &table.name,
                    fk_check,
                ) {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }
                ctx.txn.drop_table(job.schema_id, table.id)?;
                let mut fresh = table;
                fresh.id = new_table_id;
                ctx.txn
                    .create_table(job.schema_id, fresh.clone())
                    .with_context(|| format!("recreate table {}", fresh.name))?;
                let version = update_version_and_table_info(ctx.txn, job, &mut fresh, true)?;
                job.finish_table_job(JobState::Done, SchemaState::Public, version, Some(&fresh));
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("table".to_string(), other).into()),
        }
    }
}
