//! Restricted SQL sessions used by internal subsystems.
//!
//! Schema-change jobs and the runaway pipeline never talk to user sessions.
//! They borrow a session from a [`SessionPool`], run one parameterized
//! statement (or a short explicit transaction) and hand the session back.
//! [`PooledSession`] returns the session on drop so an early `?` cannot leak
//! a pooled connection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

/// Scalar value bound into, or read out of, a restricted SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Timestamp(SystemTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Binds an optional timestamp, mapping `None` to SQL `NULL`.
    pub fn opt_timestamp(value: Option<SystemTime>) -> Self {
        match value {
            Some(ts) => SqlValue::Timestamp(ts),
            None => SqlValue::Null,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        SqlValue::UInt(value)
    }
}

impl From<SystemTime> for SqlValue {
    fn from(value: SystemTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

/// One result row returned by a restricted statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<&SqlValue> {
        self.0
            .get(idx)
            .ok_or_else(|| anyhow!("row has {} columns, column {idx} requested", self.0.len()))
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64> {
        match self.get(idx)? {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::UInt(v) => {
                i64::try_from(*v).map_err(|_| anyhow!("column {idx} value {v} overflows i64"))
            }
            SqlValue::Text(raw) => raw
                .parse::<i64>()
                .map_err(|err| anyhow!("column {idx} is not an integer: {err}")),
            other => Err(anyhow!("column {idx} is not an integer: {other:?}")),
        }
    }

    pub fn get_u64(&self, idx: usize) -> Result<u64> {
        match self.get(idx)? {
            SqlValue::UInt(v) => Ok(*v),
            SqlValue::Int(v) => {
                u64::try_from(*v).map_err(|_| anyhow!("column {idx} value {v} is negative"))
            }
            SqlValue::Text(raw) => raw
                .parse::<u64>()
                .map_err(|err| anyhow!("column {idx} is not an unsigned integer: {err}")),
            other => Err(anyhow!("column {idx} is not an unsigned integer: {other:?}")),
        }
    }

    pub fn get_string(&self, idx: usize) -> Result<String> {
        match self.get(idx)? {
            SqlValue::Text(v) => Ok(v.clone()),
            SqlValue::Null => Ok(String::new()),
            SqlValue::Int(v) => Ok(v.to_string()),
            SqlValue::UInt(v) => Ok(v.to_string()),
            other => Err(anyhow!("column {idx} is not text: {other:?}")),
        }
    }

    /// Reads a nullable timestamp. Integer values are interpreted as unix milliseconds.
    pub fn get_opt_timestamp(&self, idx: usize) -> Result<Option<SystemTime>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(ts) => Ok(Some(*ts)),
            SqlValue::Int(ms) if *ms >= 0 => Ok(Some(UNIX_EPOCH + Duration::from_millis(*ms as u64))),
            SqlValue::UInt(ms) => Ok(Some(UNIX_EPOCH + Duration::from_millis(*ms))),
            other => Err(anyhow!("column {idx} is not a timestamp: {other:?}")),
        }
    }

    pub fn get_timestamp(&self, idx: usize) -> Result<SystemTime> {
        self.get_opt_timestamp(idx)?
            .ok_or_else(|| anyhow!("column {idx} is NULL, timestamp expected"))
    }
}

/// Outcome of one restricted statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlResult {
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
}

impl SqlResult {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn affected(affected_rows: u64) -> Self {
        Self {
            affected_rows,
            ..Self::default()
        }
    }

    pub fn inserted(last_insert_id: u64) -> Self {
        Self {
            affected_rows: 1,
            last_insert_id: Some(last_insert_id),
            ..Self::default()
        }
    }
}

/// Internal session able to execute parameterized SQL with `?` placeholders.
///
/// Statements run with internal privileges and bypass user-facing hooks;
/// callers must only pass identifiers through [`quote_ident`].
#[async_trait]
pub trait RestrictedSession: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<SqlResult>;
}

/// Pool of internal sessions.
pub trait SessionPool: Send + Sync {
    fn get(&self) -> Result<Box<dyn RestrictedSession>>;
    fn put(&self, session: Box<dyn RestrictedSession>);
}

/// Session borrowed from a pool, returned on drop.
pub struct PooledSession<'a> {
    pool: &'a dyn SessionPool,
    session: Option<Box<dyn RestrictedSession>>,
}

impl<'a> PooledSession<'a> {
    pub fn acquire(pool: &'a dyn SessionPool) -> Result<Self> {
        let session = pool.get()?;
        Ok(Self {
            pool,
            session: Some(session),
        })
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<SqlResult> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("pooled session already released"))?;
        session.execute(sql, params).await
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.put(session);
        }
    }
}

/// Runs one statement on a pooled session and returns the session afterwards.
pub async fn exec_restricted_sql(
    pool: &dyn SessionPool,
    sql: &str,
    params: &[SqlValue],
) -> Result<SqlResult> {
    let mut session = PooledSession::acquire(pool)?;
    let result = session.execute(sql, params).await;
    if let Err(err) = &result {
        debug!(sql = %sql, params = params.len(), error = %err, "restricted sql failed");
    }
    result
}

/// Quotes an identifier with backticks, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        if ch == '`' {
            out.push('`');
        }
        out.push(ch);
    }
    out.push('`');
    out
}
