use anyhow::Result;
use async_trait::async_trait;

use super::{invalid_args, JobContext, JobHandler};
use crate::error::DdlError;
use crate::foreign_key::check_drop_column_with_foreign_key_constraint_in_owner;
use crate::job::{Job, JobArgs, JobState};
use crate::meta::{get_table_info_and_cancel_fault_job, update_version_and_table_info};
use crate::model::{SchemaState, TableInfo};

/// `ALTER TABLE ... DROP COLUMN`: Public -> WriteOnly -> DeleteOnly -> None.
///
/// The column leaves every index it belongs to; an index left without
/// columns is dropped with it.
pub struct DropColumnHandler;

#[async_trait]
impl JobHandler for DropColumnHandler {
    async fn run_step(&self, ctx: &mut JobContext<'_>, job: &mut Job) -> Result<i64> {
        let JobArgs::DropColumn { column_name } = job.args.clone() else {
            job.state = JobState::Cancelled;
            return Err(invalid_args(job));
        };
        let mut table = get_table_info_and_cancel_fault_job(ctx.txn, job)?;
        let Some(pos) = table
            .columns
            .iter()
            .position(|col| col.name.eq_ignore_ascii_case(&column_name))
        else {
            job.state = JobState::Cancelled;
            return Err(DdlError::CantDropFieldOrKey(column_name).into());
        };

        if job.is_rolling_back() {
            let version = if table.columns[pos].state == SchemaState::Public {
                ctx.txn.schema_version()
            } else {
                table.columns[pos].state = SchemaState::Public;
                update_version_and_table_info(ctx.txn, job, &mut table, true)?
            };
            job.finish_table_job(JobState::RollbackDone, SchemaState::Public, version, Some(&table));
            return Ok(version);
        }

        match job.schema_state {
            SchemaState::Public => {
                let is = ctx.info_cache.get_latest();
                if let Err(err) = check_drop_column_with_foreign_key_constraint_in_owner(
                    ctx.config,
                    &is,
                    &job.schema_name,
                    &table,
                    &column_name,
                ) {
                    job.state = JobState::Cancelled;
                    return Err(err.into());
                }
                table.columns[pos].state = SchemaState::WriteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::WriteOnly;
                Ok(version)
            }
            SchemaState::WriteOnly => {
                table.columns[pos].state = SchemaState::DeleteOnly;
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.schema_state = SchemaState::DeleteOnly;
                Ok(version)
            }
            SchemaState::DeleteOnly => {
                remove_column(&mut table, pos);
                let version = update_version_and_table_info(ctx.txn, job, &mut table, true)?;
                job.finish_table_job(JobState::Done, SchemaState::None, version, Some(&table));
                Ok(version)
            }
            other => Err(DdlError::InvalidDdlState("column".to_string(), other).into()),
        }
    }
}

fn remove_column(table: &mut TableInfo, pos: usize) {
    let removed = table.columns.remove(pos);
    if removed.primary_key {
        table.pk_is_handle = false;
    }
    for index in &mut table.indices {
        index
            .columns
            .retain(|col| !col.name.eq_ignore_ascii_case(&removed.name));
    }
    table.indices.retain(|index| !index.columns.is_empty());
    table.reindex_offsets();
}
