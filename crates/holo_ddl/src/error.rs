//! Schema-change errors surfaced to DDL callers.
//!
//! Messages follow MySQL wording so clients see familiar text. The enum is
//! serializable because a job's error is persisted with the job and returned
//! to the waiting client only once the job reaches a terminal state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SchemaState;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DdlError {
    #[error("Duplicate foreign key constraint name '{0}'")]
    ForeignKeyDuplicateName(String),
    #[error("Cannot add foreign key constraint")]
    CannotAddForeign,
    #[error("Failed to open the referenced table '{0}'")]
    ForeignKeyCannotOpenParent(String),
    #[error("`{0}` is unsupported on temporary tables.")]
    OperationOnTemporaryTable(String),
    #[error("Set TTL for a table referenced by foreign key is not allowed")]
    TtlReferencedByForeignKey,
    #[error("Foreign keys are not yet supported in conjunction with partitioning")]
    ForeignKeyOnPartitioned,
    #[error("Key column '{0}' doesn't exist in table")]
    KeyColumnDoesNotExist(String),
    #[error("Foreign key '{0}' uses virtual column '{1}' which is not supported.")]
    ForeignKeyCannotUseVirtualColumn(String, String),
    #[error("Referencing column '{0}' and referenced column '{1}' in foreign key constraint '{2}' are incompatible.")]
    ForeignKeyColumnNotMatch(String, String, String),
    #[error("Failed to add the foreign key constraint. Missing index for constraint '{0}' in the referenced table '{1}'")]
    ForeignKeyNoIndexInParent(String, String),
    #[error("Failed to add the foreign key constraint. Missing index for constraint '{0}' in the referencing table '{1}'")]
    ForeignKeyNoIndexInChild(String, String),
    #[error("Cannot add or update a child row: a foreign key constraint fails ({0})")]
    NoReferencedRow(String),
    #[error("Cannot truncate a table referenced in a foreign key constraint ({0})")]
    TruncateIllegalForeignKey(String),
    #[error("Cannot drop column '{0}': needed in a foreign key constraint '{1}'")]
    ForeignKeyColumnCannotDrop(String, String),
    #[error("Cannot drop column '{0}': needed in a foreign key constraint '{1}' of table '{2}'")]
    ForeignKeyColumnCannotDropChild(String, String, String),
    #[error("Cannot drop index '{0}': needed in a foreign key constraint")]
    DropIndexNeededInForeignKey(String),
    #[error("Can't DROP '{0}'; check that column/key exists")]
    CantDropFieldOrKey(String),
    #[error("Table '{0}' already exists")]
    TableExists(String),
    #[error("Table '{0}.{1}' doesn't exist")]
    NoSuchTable(String, String),
    #[error("Unknown database '{0}'")]
    DatabaseNotExists(String),
    #[error("Can't create database '{0}'; database exists")]
    DatabaseExists(String),
    #[error("invalid {0} state: {1}")]
    InvalidDdlState(String, SchemaState),
    #[error("invalid job arguments for {0}")]
    InvalidJobArgs(String),
    #[error("write conflict on metadata commit (base revision {base}, current {current})")]
    WriteConflict { base: u64, current: u64 },
    #[error("ddl owner changed, step abandoned")]
    OwnerLost,
    #[error("{0}")]
    Internal(String),
}

impl DdlError {
    /// Errors raised by definition checks before any visible mutation.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            DdlError::ForeignKeyDuplicateName(_)
                | DdlError::CannotAddForeign
                | DdlError::ForeignKeyCannotOpenParent(_)
                | DdlError::OperationOnTemporaryTable(_)
                | DdlError::TtlReferencedByForeignKey
                | DdlError::ForeignKeyOnPartitioned
                | DdlError::KeyColumnDoesNotExist(_)
                | DdlError::ForeignKeyCannotUseVirtualColumn(_, _)
                | DdlError::ForeignKeyColumnNotMatch(_, _, _)
                | DdlError::ForeignKeyNoIndexInParent(_, _)
                | DdlError::ForeignKeyNoIndexInChild(_, _)
                | DdlError::TruncateIllegalForeignKey(_)
                | DdlError::ForeignKeyColumnCannotDrop(_, _)
                | DdlError::ForeignKeyColumnCannotDropChild(_, _, _)
                | DdlError::DropIndexNeededInForeignKey(_)
                | DdlError::CantDropFieldOrKey(_)
                | DdlError::TableExists(_)
                | DdlError::NoSuchTable(_, _)
                | DdlError::DatabaseNotExists(_)
                | DdlError::DatabaseExists(_)
                | DdlError::InvalidJobArgs(_)
        )
    }

    /// Errors that leave the job untouched so the next round retries the step.
    pub fn is_transient(&self) -> bool {
        matches!(self, DdlError::WriteConflict { .. } | DdlError::OwnerLost)
    }
}

/// Recovers the typed error carried inside an `anyhow::Error` chain.
pub fn as_ddl_error(err: &anyhow::Error) -> Option<&DdlError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DdlError>())
}

/// Converts any error into the persisted form, keeping typed errors intact.
pub fn to_persisted_error(err: &anyhow::Error) -> DdlError {
    match as_ddl_error(err) {
        Some(typed) => typed.clone(),
        None => DdlError::Internal(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_error_survives_context_wrapping() {
        let err = Err::<(), _>(DdlError::ForeignKeyNoIndexInParent(
            "fk1".to_string(),
            "parent".to_string(),
        ))
        .context("run add foreign key step")
        .unwrap_err();
        let typed = as_ddl_error(&err).expect("typed error");
        assert!(typed.is_cancellable());
        assert_eq!(
            typed.to_string(),
            "Failed to add the foreign key constraint. Missing index for constraint 'fk1' in the referenced table 'parent'"
        );
    }

    #[test]
    fn untyped_errors_persist_as_internal() {
        let err = anyhow::anyhow!("storage unavailable");
        assert_eq!(
            to_persisted_error(&err),
            DdlError::Internal("storage unavailable".to_string())
        );
    }
}
