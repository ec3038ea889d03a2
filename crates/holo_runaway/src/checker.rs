//! Per-statement runaway checks.
//!
//! A [`RunawayChecker`] is created for each statement executed under a
//! resource group. `before_execution` consults the watch list; the executor
//! then calls `check_thresholds` as the statement makes progress.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::RunawayError;
use crate::manager::{RunawayManager, WatchHit};
use crate::model::{QueryIdentity, RunawayActionType, RunawayMatchType, RunawayWatchType};

/// Watch entry created when a group's limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSetting {
    pub watch_type: RunawayWatchType,
    /// Zero never expires.
    pub duration: Duration,
}

/// Runaway limits of one resource group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLimit {
    pub exec_elapsed: Option<Duration>,
    pub processed_keys: Option<u64>,
    pub request_units: Option<u64>,
    pub action: RunawayActionType,
    pub switch_group_name: String,
    pub watch: Option<WatchSetting>,
}

impl QueryLimit {
    /// Describes the first limit exceeded by the given progress.
    pub fn exceed_cause(&self, elapsed: Duration, processed_keys: u64, request_units: u64) -> Option<String> {
        if let Some(limit) = self.exec_elapsed.filter(|limit| elapsed > *limit) {
            return Some(format!("ElapsedTime = {elapsed:?}({limit:?})"));
        }
        if let Some(limit) = self.processed_keys.filter(|limit| processed_keys > *limit) {
            return Some(format!("ProcessedKeys = {processed_keys}({limit})"));
        }
        if let Some(limit) = self.request_units.filter(|limit| request_units > *limit) {
            return Some(format!("RequestUnit = {request_units}({limit})"));
        }
        None
    }
}

#[derive(Debug, Clone)]
struct Verdict {
    action: RunawayActionType,
    exceed_cause: String,
}

impl Verdict {
    fn outcome(&self) -> Result<Option<RunawayActionType>, RunawayError> {
        match self.action {
            RunawayActionType::Kill => Err(RunawayError::QueryInterrupted(self.exceed_cause.clone())),
            action => Ok(Some(action)),
        }
    }
}

pub struct RunawayChecker {
    manager: Arc<RunawayManager>,
    query: QueryIdentity,
    limit: Option<QueryLimit>,
    verdict: OnceLock<Verdict>,
}

impl RunawayChecker {
    pub fn new(manager: Arc<RunawayManager>, query: QueryIdentity, limit: Option<QueryLimit>) -> Self {
        Self {
            manager,
            query,
            limit,
            verdict: OnceLock::new(),
        }
    }

    pub fn query(&self) -> &QueryIdentity {
        &self.query
    }

    /// Checks the statement against the watch list by exact text, SQL
    /// digest and plan digest, in that order.
    ///
    /// A hit is recorded as a `watch` match. Kill watches interrupt the
    /// statement; other actions are returned for the executor to apply.
    pub fn before_execution(&self, now: SystemTime) -> Result<Option<WatchHit>, RunawayError> {
        let group = self.query.resource_group_name.as_str();
        let hit = [
            RunawayWatchType::Exact,
            RunawayWatchType::Similar,
            RunawayWatchType::Plan,
        ]
        .into_iter()
        .filter_map(|watch| self.query.convict(watch))
        .find_map(|convict| self.manager.examine_watch_list(group, convict));
        let Some(hit) = hit else {
            return Ok(None);
        };
        self.manager.mark_runaway(
            &self.query,
            hit.action,
            RunawayMatchType::Watch,
            now,
            &hit.exceed_cause,
        );
        if hit.action == RunawayActionType::Kill {
            return Err(RunawayError::Quarantined);
        }
        Ok(Some(hit))
    }

    /// Evaluates the group's limit against the statement's progress.
    ///
    /// The first violation is recorded (and quarantined when the limit has a
    /// watch setting); later calls repeat the same verdict without recording.
    pub fn check_thresholds(
        &self,
        elapsed: Duration,
        processed_keys: u64,
        request_units: u64,
        now: SystemTime,
    ) -> Result<Option<RunawayActionType>, RunawayError> {
        let Some(limit) = self.limit.as_ref() else {
            return Ok(None);
        };
        if let Some(verdict) = self.verdict.get() {
            return verdict.outcome();
        }
        let Some(exceed_cause) = limit.exceed_cause(elapsed, processed_keys, request_units) else {
            return Ok(None);
        };
        let verdict = Verdict {
            action: limit.action,
            exceed_cause,
        };
        if self.verdict.set(verdict.clone()).is_ok() {
            self.mark(limit, &verdict, now);
        }
        self.verdict.get().unwrap_or(&verdict).outcome()
    }

    fn mark(&self, limit: &QueryLimit, verdict: &Verdict, now: SystemTime) {
        self.manager.mark_runaway(
            &self.query,
            verdict.action,
            RunawayMatchType::Identify,
            now,
            &verdict.exceed_cause,
        );
        let Some(setting) = limit.watch.as_ref() else {
            return;
        };
        let Some(convict) = self.query.convict(setting.watch_type) else {
            return;
        };
        self.manager.mark_quarantine(
            &self.query.resource_group_name,
            convict,
            setting.watch_type,
            verdict.action,
            &limit.switch_group_name,
            setting.duration,
            now,
            &verdict.exceed_cause,
        );
    }
}
