//! Watch entries and runaway records.

use std::fmt;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use holo_session::{Row, SqlValue};
use serde::{Deserialize, Serialize};

/// Source recorded for watches added by an operator.
pub const MANUAL_SOURCE: &str = "manual";

/// Mitigation applied to a runaway or watched query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunawayActionType {
    #[default]
    None,
    DryRun,
    CoolDown,
    Kill,
    SwitchGroup,
}

impl RunawayActionType {
    pub fn as_i64(self) -> i64 {
        match self {
            RunawayActionType::None => 0,
            RunawayActionType::DryRun => 1,
            RunawayActionType::CoolDown => 2,
            RunawayActionType::Kill => 3,
            RunawayActionType::SwitchGroup => 4,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        Ok(match value {
            0 => RunawayActionType::None,
            1 => RunawayActionType::DryRun,
            2 => RunawayActionType::CoolDown,
            3 => RunawayActionType::Kill,
            4 => RunawayActionType::SwitchGroup,
            other => return Err(anyhow!("unknown runaway action {other}")),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunawayActionType::None => "NONE",
            RunawayActionType::DryRun => "DRYRUN",
            RunawayActionType::CoolDown => "COOLDOWN",
            RunawayActionType::Kill => "KILL",
            RunawayActionType::SwitchGroup => "SWITCH_GROUP",
        }
    }
}

impl fmt::Display for RunawayActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What part of a query a watch entry matches on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunawayWatchType {
    #[default]
    None,
    /// Exact SQL text.
    Exact,
    /// Normalized SQL digest.
    Similar,
    /// Plan digest.
    Plan,
}

impl RunawayWatchType {
    pub fn as_i64(self) -> i64 {
        match self {
            RunawayWatchType::None => 0,
            RunawayWatchType::Exact => 1,
            RunawayWatchType::Similar => 2,
            RunawayWatchType::Plan => 3,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        Ok(match value {
            0 => RunawayWatchType::None,
            1 => RunawayWatchType::Exact,
            2 => RunawayWatchType::Similar,
            3 => RunawayWatchType::Plan,
            other => return Err(anyhow!("unknown runaway watch type {other}")),
        })
    }
}

/// How a runaway record was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunawayMatchType {
    /// The query hit an existing watch entry.
    Watch,
    /// The query crossed a resource-group threshold while running.
    Identify,
}

impl RunawayMatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunawayMatchType::Watch => "watch",
            RunawayMatchType::Identify => "identify",
        }
    }
}

impl fmt::Display for RunawayMatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one statement as seen by the runaway checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryIdentity {
    pub resource_group_name: String,
    pub original_sql: String,
    pub sql_digest: String,
    pub plan_digest: String,
}

impl QueryIdentity {
    /// Text a watch of `watch` type matches against.
    pub fn convict(&self, watch: RunawayWatchType) -> Option<&str> {
        let text = match watch {
            RunawayWatchType::Exact => self.original_sql.as_str(),
            RunawayWatchType::Similar => self.sql_digest.as_str(),
            RunawayWatchType::Plan => self.plan_digest.as_str(),
            RunawayWatchType::None => return None,
        };
        (!text.is_empty()).then_some(text)
    }
}

/// Active quarantine entry.
///
/// `id == 0` marks a provisional entry created by local detection that has
/// not been written to `mysql.holo_runaway_watch` yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: i64,
    pub resource_group_name: String,
    pub start_time: SystemTime,
    /// `None` never expires.
    pub end_time: Option<SystemTime>,
    pub watch: RunawayWatchType,
    pub watch_text: String,
    pub source: String,
    pub action: RunawayActionType,
    pub switch_group_name: String,
    pub exceed_cause: String,
}

impl QuarantineRecord {
    pub fn record_key(&self) -> String {
        watch_key(&self.resource_group_name, &self.watch_text)
    }

    pub fn is_durable(&self) -> bool {
        self.id != 0
    }

    pub fn is_manual(&self) -> bool {
        self.source == MANUAL_SOURCE
    }

    pub fn lifetime(&self, now: SystemTime) -> Lifetime {
        match self.end_time {
            None => Lifetime::Unbounded,
            Some(end) => match end.duration_since(now) {
                Ok(left) if !left.is_zero() => Lifetime::Remaining(left),
                _ => Lifetime::Ended,
            },
        }
    }

    /// Decodes a row of
    /// `id, resource_group_name, start_time, end_time, watch, watch_text,
    /// source, action, switch_group_name, exceed_cause`.
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_i64(0)?,
            resource_group_name: row.get_string(1)?,
            start_time: row.get_timestamp(2)?,
            end_time: row.get_opt_timestamp(3)?,
            watch: RunawayWatchType::from_i64(row.get_i64(4)?)?,
            watch_text: row.get_string(5)?,
            source: row.get_string(6)?,
            action: RunawayActionType::from_i64(row.get_i64(7)?)?,
            switch_group_name: row.get_string(8)?,
            exceed_cause: row.get_string(9)?,
        })
    }

    /// Bind parameters in the column order of `from_row`, without `id`.
    pub fn insert_params(&self) -> Vec<SqlValue> {
        vec![
            self.resource_group_name.clone().into(),
            self.start_time.into(),
            SqlValue::opt_timestamp(self.end_time),
            self.watch.as_i64().into(),
            self.watch_text.clone().into(),
            self.source.clone().into(),
            self.action.as_i64().into(),
            self.switch_group_name.clone().into(),
            self.exceed_cause.clone().into(),
        ]
    }
}

/// Remaining lifetime of a watch entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Unbounded,
    Remaining(Duration),
    Ended,
}

pub fn watch_key(resource_group_name: &str, watch_text: &str) -> String {
    format!("{resource_group_name}/{watch_text}")
}

/// One detected runaway query, buffered by the flush loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub resource_group_name: String,
    pub start_time: SystemTime,
    pub match_type: RunawayMatchType,
    pub action: RunawayActionType,
    pub sample_text: String,
    pub sql_digest: String,
    pub plan_digest: String,
    pub source: String,
    pub exceed_cause: String,
    pub repeats: u64,
}

impl Record {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            resource_group_name: self.resource_group_name.clone(),
            sql_digest: self.sql_digest.clone(),
            plan_digest: self.plan_digest.clone(),
            match_type: self.match_type,
        }
    }

    pub(crate) fn insert_params(&self) -> Vec<SqlValue> {
        vec![
            self.resource_group_name.clone().into(),
            self.start_time.into(),
            self.match_type.as_str().into(),
            self.action.as_str().into(),
            self.sample_text.clone().into(),
            self.sql_digest.clone().into(),
            self.plan_digest.clone().into(),
            self.source.clone().into(),
            self.exceed_cause.clone().into(),
            self.repeats.into(),
        ]
    }
}

/// Deduplication key of buffered records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub resource_group_name: String,
    pub sql_digest: String,
    pub plan_digest: String,
    pub match_type: RunawayMatchType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(end_time: Option<SystemTime>) -> QuarantineRecord {
        QuarantineRecord {
            id: 3,
            resource_group_name: "rg1".into(),
            start_time: SystemTime::UNIX_EPOCH,
            end_time,
            watch: RunawayWatchType::Similar,
            watch_text: "digest".into(),
            source: MANUAL_SOURCE.into(),
            action: RunawayActionType::CoolDown,
            switch_group_name: String::new(),
            exceed_cause: String::new(),
        }
    }

    #[test]
    fn lifetime_distinguishes_unbounded_and_ended() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(record(None).lifetime(now), Lifetime::Unbounded);
        assert_eq!(
            record(Some(now + Duration::from_secs(5))).lifetime(now),
            Lifetime::Remaining(Duration::from_secs(5))
        );
        assert_eq!(record(Some(now)).lifetime(now), Lifetime::Ended);
        assert_eq!(record(Some(SystemTime::UNIX_EPOCH)).lifetime(now), Lifetime::Ended);
    }

    #[test]
    fn watch_row_decodes_with_null_end_time() {
        let original = record(None);
        let mut values = vec![SqlValue::Int(original.id)];
        values.extend(original.insert_params());
        let decoded = QuarantineRecord::from_row(&Row::new(values)).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.record_key(), "rg1/digest");
        assert!(decoded.is_manual());
    }

    #[test]
    fn convict_skips_empty_digests() {
        let query = QueryIdentity {
            resource_group_name: "rg1".into(),
            original_sql: "select 1".into(),
            sql_digest: "abc".into(),
            plan_digest: String::new(),
        };
        assert_eq!(query.convict(RunawayWatchType::Exact), Some("select 1"));
        assert_eq!(query.convict(RunawayWatchType::Similar), Some("abc"));
        assert_eq!(query.convict(RunawayWatchType::Plan), None);
        assert_eq!(query.convict(RunawayWatchType::None), None);
    }
}
