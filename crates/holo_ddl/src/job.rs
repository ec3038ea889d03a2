//! Schema-change job records.
//!
//! A job is created by a client statement, queued in the metadata store and
//! advanced one schema state per scheduler round by the owner. Terminal jobs
//! move to the history table where waiting clients pick them up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DdlError;
use crate::model::{ForeignKeyInfo, SchemaState, TableInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CreateTable,
    DropTable,
    TruncateTable,
    AddForeignKey,
    DropForeignKey,
    DropIndex,
    DropColumn,
}

const ADD_ORDER: &[SchemaState] = &[
    SchemaState::None,
    SchemaState::WriteOnly,
    SchemaState::WriteReorganization,
    SchemaState::Public,
];
const CREATE_ORDER: &[SchemaState] = &[SchemaState::None, SchemaState::Public];
const DROP_ORDER: &[SchemaState] = &[
    SchemaState::Public,
    SchemaState::WriteOnly,
    SchemaState::DeleteOnly,
    SchemaState::None,
];
const SINGLE_DROP_ORDER: &[SchemaState] = &[SchemaState::Public, SchemaState::None];

impl JobType {
    pub const ALL: [JobType; 7] = [
        JobType::CreateTable,
        JobType::DropTable,
        JobType::TruncateTable,
        JobType::AddForeignKey,
        JobType::DropForeignKey,
        JobType::DropIndex,
        JobType::DropColumn,
    ];

    /// Forward order of schema states a job of this type walks through.
    pub fn state_order(self) -> &'static [SchemaState] {
        match self {
            JobType::AddForeignKey => ADD_ORDER,
            JobType::CreateTable | JobType::TruncateTable => CREATE_ORDER,
            JobType::DropTable | JobType::DropIndex | JobType::DropColumn => DROP_ORDER,
            JobType::DropForeignKey => SINGLE_DROP_ORDER,
        }
    }

    pub fn initial_schema_state(self) -> SchemaState {
        self.state_order()[0]
    }

    /// Whether one successful step may move a job from `from` to `to`.
    ///
    /// Forward steps advance at most one position. A job leaving the forward
    /// path may only land on `None` or back on its initial state.
    pub fn is_valid_transition(self, from: SchemaState, to: SchemaState, state: JobState) -> bool {
        if from == to {
            return true;
        }
        if matches!(state, JobState::RollingBack | JobState::RollbackDone | JobState::Cancelled) {
            return to == SchemaState::None || to == self.initial_schema_state();
        }
        let order = self.state_order();
        match (
            order.iter().position(|s| *s == from),
            order.iter().position(|s| *s == to),
        ) {
            (Some(from_pos), Some(to_pos)) => to_pos == from_pos + 1,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::CreateTable => "create table",
            JobType::DropTable => "drop table",
            JobType::TruncateTable => "truncate table",
            JobType::AddForeignKey => "add foreign key",
            JobType::DropForeignKey => "drop foreign key",
            JobType::DropIndex => "drop index",
            JobType::DropColumn => "drop column",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Done,
    RollingBack,
    RollbackDone,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::RollbackDone | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queueing",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::RollingBack => "rollingback",
            JobState::RollbackDone => "rollback done",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Type-specific arguments, fixed at submission time except for ids the
/// owner allocates on the first step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobArgs {
    CreateTable { table: TableInfo, fk_check: bool },
    DropTable { fk_check: bool },
    TruncateTable { new_table_id: i64, fk_check: bool },
    AddForeignKey { fk: ForeignKeyInfo, fk_check: bool },
    DropForeignKey { fk_name: String },
    DropIndex { index_name: String },
    DropColumn { column_name: String },
}

impl JobArgs {
    pub fn job_type(&self) -> JobType {
        match self {
            JobArgs::CreateTable { .. } => JobType::CreateTable,
            JobArgs::DropTable { .. } => JobType::DropTable,
            JobArgs::TruncateTable { .. } => JobType::TruncateTable,
            JobArgs::AddForeignKey { .. } => JobType::AddForeignKey,
            JobArgs::DropForeignKey { .. } => JobType::DropForeignKey,
            JobArgs::DropIndex { .. } => JobType::DropIndex,
            JobArgs::DropColumn { .. } => JobType::DropColumn,
        }
    }
}

/// Table snapshot and schema version attached when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedInfo {
    pub schema_version: i64,
    pub table: Option<TableInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub schema_id: i64,
    pub table_id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub schema_state: SchemaState,
    pub state: JobState,
    pub args: JobArgs,
    /// Schema version produced by the last committed step.
    #[serde(default)]
    pub schema_version: i64,
    #[serde(default)]
    pub error: Option<DdlError>,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub finished: Option<FinishedInfo>,
}

impl Job {
    pub fn new(schema_id: i64, table_id: i64, schema_name: &str, table_name: &str, args: JobArgs) -> Self {
        let job_type = args.job_type();
        Self {
            id: 0,
            job_type,
            schema_id,
            table_id,
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            schema_state: job_type.initial_schema_state(),
            state: JobState::Queued,
            args,
            schema_version: 0,
            error: None,
            error_count: 0,
            row_count: 0,
            finished: None,
        }
    }

    pub fn is_rolling_back(&self) -> bool {
        self.state == JobState::RollingBack
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Marks the job terminal and attaches the table snapshot for waiters.
    pub fn finish_table_job(
        &mut self,
        state: JobState,
        schema_state: SchemaState,
        version: i64,
        table: Option<&TableInfo>,
    ) {
        self.state = state;
        self.schema_state = schema_state;
        self.finished = Some(FinishedInfo {
            schema_version: version,
            table: table.cloned(),
        });
    }

    /// Moves a failed job onto its undo path, or cancels it outright when
    /// no step has taken visible effect yet.
    pub fn convert_to_rollback(&mut self) {
        if self.schema_state == self.job_type.initial_schema_state() {
            self.state = JobState::Cancelled;
        } else {
            self.state = JobState::RollingBack;
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID:{}, Type:{}, State:{}, SchemaState:{}, SchemaID:{}, TableID:{}, ErrCount:{}",
            self.id,
            self.job_type,
            self.state,
            self.schema_state,
            self.schema_id,
            self.table_id,
            self.error_count
        )
    }
}
