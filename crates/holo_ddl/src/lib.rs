//! Asynchronous, job-based online schema changes.
//!
//! Clients queue jobs through [`Ddl`]; the elected owner advances each job
//! one schema state per committed metadata transaction until it is done,
//! cancelled or rolled back. Foreign-key constraints are validated both at
//! submission and authoritatively inside the owner.

pub mod config;
pub mod error;
pub mod executor;
pub mod foreign_key;
pub mod handlers;
pub mod infoschema;
pub mod job;
pub mod meta;
pub mod model;
pub mod scheduler;

pub use config::DdlConfig;
pub use error::{as_ddl_error, DdlError};
pub use executor::Ddl;
pub use handlers::{HandlerRegistry, JobContext, JobHandler, StepContext};
pub use infoschema::{InfoCache, InfoSchema};
pub use job::{FinishedInfo, Job, JobArgs, JobState, JobType};
pub use meta::{MetaSnapshot, MetaStore, MetaTxn};
pub use model::{
    ColumnInfo, ColumnType, FieldType, ForeignKeyInfo, IndexInfo, ReferredForeignKey, SchemaInfo,
    SchemaState, TableInfo, TempTableType,
};
pub use scheduler::{DdlContext, DdlScheduler, OwnerManager, StaticOwner};
