//! In-memory session pool that records statements and answers them through
//! a caller-supplied responder. Used to exercise restricted-SQL callers
//! without a storage engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::{RestrictedSession, SessionPool, SqlResult, SqlValue};

type Responder = dyn Fn(&str, &[SqlValue]) -> Result<SqlResult> + Send + Sync;

/// Statement captured by a [`ScriptedPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

struct ScriptedInner {
    responder: RwLock<Arc<Responder>>,
    log: Mutex<Vec<ExecutedStatement>>,
    // Lowercased SQL fragment and how long matching statements take.
    delays: Mutex<Vec<(String, Duration)>>,
    outstanding: AtomicUsize,
}

/// Cloneable handle; clones share the statement log and responder.
#[derive(Clone)]
pub struct ScriptedPool {
    inner: Arc<ScriptedInner>,
}

impl ScriptedPool {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[SqlValue]) -> Result<SqlResult> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ScriptedInner {
                responder: RwLock::new(Arc::new(responder)),
                log: Mutex::new(Vec::new()),
                delays: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Pool answering every statement with an empty result.
    pub fn empty() -> Self {
        Self::new(|_, _| Ok(SqlResult::default()))
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &[SqlValue]) -> Result<SqlResult> + Send + Sync + 'static,
    {
        *self
            .inner
            .responder
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(responder);
    }

    /// Makes statements containing `needle` (case-insensitive) take `delay`
    /// before they are answered. They are logged when they start.
    pub fn delay_statements(&self, needle: &str, delay: Duration) {
        self.inner
            .delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((needle.to_ascii_lowercase(), delay));
    }

    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Statements whose SQL contains `needle` (case-insensitive).
    pub fn statements_containing(&self, needle: &str) -> Vec<ExecutedStatement> {
        let needle = needle.to_ascii_lowercase();
        self.statements()
            .into_iter()
            .filter(|stmt| stmt.sql.to_ascii_lowercase().contains(needle.as_str()))
            .collect()
    }

    pub fn clear(&self) {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Sessions handed out and not yet returned.
    pub fn outstanding_sessions(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    inner: Arc<ScriptedInner>,
}

#[async_trait]
impl RestrictedSession for ScriptedSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<SqlResult> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ExecutedStatement {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
        let delay = {
            let lowered = sql.to_ascii_lowercase();
            self.inner
                .delays
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .filter(|(needle, _)| lowered.contains(needle.as_str()))
                .map(|(_, delay)| *delay)
                .max()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let responder = self
            .inner
            .responder
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        responder(sql, params)
    }
}

impl SessionPool for ScriptedPool {
    fn get(&self) -> Result<Box<dyn RestrictedSession>> {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            inner: self.inner.clone(),
        }))
    }

    fn put(&self, _session: Box<dyn RestrictedSession>) {
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
