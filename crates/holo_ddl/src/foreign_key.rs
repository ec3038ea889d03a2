//! Foreign-key constraint validation.
//!
//! Definition checks run twice: once when the statement is submitted, against
//! whatever schema the session sees, and again inside the owner where the
//! result is authoritative and a failure cancels the job. The row-level
//! orphan check only runs in the owner.

use anyhow::{Context, Result};
use holo_session::{exec_restricted_sql, quote_ident, SessionPool};
use tracing::debug;

use crate::config::DdlConfig;
use crate::error::DdlError;
use crate::handlers::StepContext;
use crate::infoschema::InfoSchema;
use crate::model::{
    names_equal, ForeignKeyInfo, ReferredForeignKey, SchemaState, TableInfo, TempTableType,
};

/// Checks column compatibility and parent index coverage for one constraint.
pub fn check_table_foreign_key(
    config: &DdlConfig,
    refer: &TableInfo,
    child: &TableInfo,
    fk: &ForeignKeyInfo,
) -> Result<(), DdlError> {
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    for (col_name, ref_col_name) in fk.cols.iter().zip(&fk.ref_cols) {
        let ref_col = refer
            .find_column(ref_col_name)
            .ok_or_else(|| DdlError::KeyColumnDoesNotExist(ref_col_name.clone()))?;
        if ref_col.is_virtual_generated() {
            return Err(DdlError::ForeignKeyCannotUseVirtualColumn(
                fk.name.clone(),
                ref_col_name.clone(),
            ));
        }
        let col = child
            .find_column(col_name)
            .ok_or_else(|| DdlError::KeyColumnDoesNotExist(col_name.clone()))?;
        if col.is_virtual_generated() {
            return Err(DdlError::ForeignKeyCannotUseVirtualColumn(
                fk.name.clone(),
                col_name.clone(),
            ));
        }
        let (ft, ref_ft) = (&col.field_type, &ref_col.field_type);
        if ft.tp != ref_ft.tp
            || ft.unsigned != ref_ft.unsigned
            || !ft.charset.eq_ignore_ascii_case(&ref_ft.charset)
            || !ft.collation.eq_ignore_ascii_case(&ref_ft.collation)
        {
            return Err(DdlError::ForeignKeyColumnNotMatch(
                col_name.clone(),
                ref_col_name.clone(),
                fk.name.clone(),
            ));
        }
    }
    if refer.covering_index_name(&fk.ref_cols).is_none() {
        return Err(DdlError::ForeignKeyNoIndexInParent(
            fk.name.clone(),
            fk.ref_table.clone(),
        ));
    }
    Ok(())
}

/// Resolves the parent and validates the constraint against it. Parent-less
/// constraints pass when `fk_check` is off so the check can be deferred.
pub fn check_table_foreign_key_valid(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    fk: &ForeignKeyInfo,
    fk_check: bool,
) -> Result<(), DdlError> {
    if fk.cols.is_empty() || fk.cols.len() != fk.ref_cols.len() {
        return Err(DdlError::CannotAddForeign);
    }
    let self_reference =
        fk.ref_schema.eq_ignore_ascii_case(schema) && fk.ref_table.eq_ignore_ascii_case(&table.name);
    if self_reference && names_equal(&fk.cols, &fk.ref_cols) {
        return Err(DdlError::CannotAddForeign);
    }
    if table.temp_table != TempTableType::None {
        return Err(DdlError::OperationOnTemporaryTable("foreign key".to_string()));
    }
    if table.partition.is_some() {
        return Err(DdlError::ForeignKeyOnPartitioned);
    }

    let parent;
    let refer: &TableInfo = if self_reference {
        table
    } else {
        match is.table_by_name(&fk.ref_schema, &fk.ref_table) {
            Ok(found) => {
                parent = found;
                &parent
            }
            Err(_) if !fk_check => return Ok(()),
            Err(_) => return Err(DdlError::ForeignKeyCannotOpenParent(fk.ref_table.clone())),
        }
    };
    if refer.temp_table != TempTableType::None {
        return Err(DdlError::OperationOnTemporaryTable("foreign key".to_string()));
    }
    if refer.ttl.is_some() {
        return Err(DdlError::TtlReferencedByForeignKey);
    }
    if refer.partition.is_some() {
        return Err(DdlError::ForeignKeyOnPartitioned);
    }
    check_table_foreign_key(config, refer, table, fk)
}

/// Submission-time and owner-time check for `ALTER TABLE ... ADD FOREIGN KEY`.
pub fn check_add_foreign_key_valid(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    fk: &ForeignKeyInfo,
    fk_check: bool,
) -> Result<(), DdlError> {
    check_fk_dup_name(table, &fk.name)?;
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    check_table_foreign_key_valid(config, is, schema, table, fk, fk_check)?;
    if table.covering_index_name(&fk.cols).is_none() {
        return Err(DdlError::ForeignKeyNoIndexInChild(
            fk.name.clone(),
            table.name.clone(),
        ));
    }
    Ok(())
}

pub fn check_add_foreign_key_valid_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    fk: &ForeignKeyInfo,
    fk_check: bool,
) -> Result<(), DdlError> {
    check_add_foreign_key_valid(config, is, schema, table, fk, fk_check)
}

/// Validates every constraint declared by a new table.
pub fn check_table_foreign_key_valid_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    fk_check: bool,
) -> Result<(), DdlError> {
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    for (pos, fk) in table.foreign_keys.iter().enumerate() {
        if table.foreign_keys[..pos]
            .iter()
            .any(|prev| prev.name.eq_ignore_ascii_case(&fk.name))
        {
            return Err(DdlError::ForeignKeyDuplicateName(fk.name.clone()));
        }
        check_table_foreign_key_valid(config, is, schema, table, fk, fk_check)?;
        if table.covering_index_name(&fk.cols).is_none() {
            return Err(DdlError::ForeignKeyNoIndexInChild(
                fk.name.clone(),
                table.name.clone(),
            ));
        }
    }
    Ok(())
}

pub fn check_fk_dup_name(table: &TableInfo, fk_name: &str) -> Result<(), DdlError> {
    if table.find_foreign_key(fk_name).is_some() {
        return Err(DdlError::ForeignKeyDuplicateName(fk_name.to_string()));
    }
    Ok(())
}

/// Verifies that no child row references a missing parent row.
///
/// Runs a single-row anti-join on a pooled restricted session; the session
/// goes back to the pool whether the query succeeds, fails or is abandoned.
pub async fn check_foreign_key_constrain(
    pool: &dyn SessionPool,
    step: &StepContext,
    schema: &str,
    table: &str,
    fk: &ForeignKeyInfo,
    fk_check: bool,
) -> Result<()> {
    if !fk_check {
        return Ok(());
    }
    let sql = orphan_check_sql(schema, table, fk);
    debug!(sql = %sql, fk = %fk.name, "checking foreign key rows");
    let result = tokio::select! {
        biased;
        _ = step.cancelled() => return Err(DdlError::OwnerLost.into()),
        result = exec_restricted_sql(pool, &sql, &[]) => result,
    };
    let result = result.with_context(|| format!("check rows for foreign key {}", fk.name))?;
    if !result.rows.is_empty() {
        return Err(DdlError::NoReferencedRow(fk.describe(schema, table)).into());
    }
    Ok(())
}

// Column-wise NOT EXISTS: a NULL parent value never matches, so it cannot
// hide an orphan.
fn orphan_check_sql(schema: &str, table: &str, fk: &ForeignKeyInfo) -> String {
    let not_null = fk
        .cols
        .iter()
        .map(|col| format!("fk_child.{} IS NOT NULL", quote_ident(col)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let matches = fk
        .cols
        .iter()
        .zip(&fk.ref_cols)
        .map(|(col, ref_col)| format!("fk_parent.{} = fk_child.{}", quote_ident(ref_col), quote_ident(col)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT 1 FROM {}.{} AS fk_child WHERE {not_null} AND NOT EXISTS \
         (SELECT 1 FROM {}.{} AS fk_parent WHERE {matches}) LIMIT 1",
        quote_ident(schema),
        quote_ident(table),
        quote_ident(&fk.ref_schema),
        quote_ident(&fk.ref_table),
    )
}

/// First constraint referencing `schema.table` from a table other than the
/// ignored ones.
fn check_table_has_foreign_key_referred<'a>(
    is: &'a InfoSchema,
    schema: &str,
    table: &str,
    ignore_tables: &[(&str, &str)],
    fk_check: bool,
) -> Option<&'a ReferredForeignKey> {
    if !fk_check {
        return None;
    }
    is.table_referred_foreign_keys(schema, table)
        .iter()
        .find(|referred| {
            !ignore_tables.iter().any(|(s, t)| {
                referred.child_schema.eq_ignore_ascii_case(s) && referred.child_table.eq_ignore_ascii_case(t)
            })
        })
}

fn referred_detail(referred: &ReferredForeignKey) -> String {
    format!(
        "{}.{} CONSTRAINT {}",
        quote_ident(&referred.child_schema),
        quote_ident(&referred.child_table),
        quote_ident(&referred.child_fk_name)
    )
}

/// Fails when a table other than `schema.table` itself references it.
fn check_referred_by_other_tables(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &str,
    fk_check: bool,
) -> Result<(), DdlError> {
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    match check_table_has_foreign_key_referred(is, schema, table, &[(schema, table)], fk_check) {
        Some(referred) => Err(DdlError::TruncateIllegalForeignKey(referred_detail(referred))),
        None => Ok(()),
    }
}

/// Rejects dropping a table still referenced by another table's constraint.
pub fn check_drop_table_has_foreign_key_referred_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &str,
    fk_check: bool,
) -> Result<(), DdlError> {
    check_referred_by_other_tables(config, is, schema, table, fk_check)
}

/// Truncation keeps self references valid, so only other children block it.
pub fn check_truncate_table_has_foreign_key_referred_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &str,
    fk_check: bool,
) -> Result<(), DdlError> {
    check_referred_by_other_tables(config, is, schema, table, fk_check)
}

/// Rejects dropping an index that is the last one serving a constraint,
/// either as the child side or as a referenced parent.
pub fn check_index_needed_in_foreign_key_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    index_name: &str,
) -> Result<(), DdlError> {
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    let Some(index) = table.find_index(index_name) else {
        return Ok(());
    };
    let referred = is.table_referred_foreign_keys(schema, &table.name);
    if table.foreign_keys.is_empty() && referred.is_empty() {
        return Ok(());
    }
    let remaining: Vec<_> = table
        .indices
        .iter()
        .filter(|idx| idx.id != index.id && idx.state == SchemaState::Public)
        .collect();
    let check = |cols: &[String]| -> Result<(), DdlError> {
        if !table.is_index_prefix_covered(index, cols) {
            return Ok(());
        }
        if cols.len() == 1 {
            if let Some(pk) = table.pk_handle_column() {
                if pk.name.eq_ignore_ascii_case(&cols[0]) {
                    return Ok(());
                }
            }
        }
        if remaining
            .iter()
            .any(|idx| table.is_index_prefix_covered(idx, cols))
        {
            return Ok(());
        }
        Err(DdlError::DropIndexNeededInForeignKey(index.name.clone()))
    };
    for fk in table.foreign_keys.iter().filter(|fk| fk.is_enforced()) {
        check(&fk.cols)?;
    }
    for referred in referred {
        check(&referred.cols)?;
    }
    Ok(())
}

/// Rejects dropping a column used by a constraint on either side.
pub fn check_drop_column_with_foreign_key_constraint_in_owner(
    config: &DdlConfig,
    is: &InfoSchema,
    schema: &str,
    table: &TableInfo,
    column: &str,
) -> Result<(), DdlError> {
    if !config.foreign_key_enabled() {
        return Ok(());
    }
    for fk in &table.foreign_keys {
        if fk.cols.iter().any(|col| col.eq_ignore_ascii_case(column)) {
            return Err(DdlError::ForeignKeyColumnCannotDrop(
                column.to_string(),
                fk.name.clone(),
            ));
        }
    }
    for referred in is.table_referred_foreign_keys(schema, &table.name) {
        if referred.cols.iter().any(|col| col.eq_ignore_ascii_case(column)) {
            return Err(DdlError::ForeignKeyColumnCannotDropChild(
                column.to_string(),
                referred.child_fk_name.clone(),
                referred.child_table.clone(),
            ));
        }
    }
    Ok(())
}
