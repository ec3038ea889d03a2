//! Schema-change engine configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_ERROR_COUNT_LIMIT: u64 = 512;

/// Engine-wide settings handed to the scheduler and validators at startup.
///
/// Only the foreign-key switch is reloadable at runtime; everything else is
/// fixed for the lifetime of the engine.
#[derive(Debug)]
pub struct DdlConfig {
    enable_foreign_key: AtomicBool,
    /// How often the owner worker polls the job queue when idle.
    pub job_poll_interval: Duration,
    /// Retryable step failures tolerated before a job is rolled back.
    pub error_count_limit: u64,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            enable_foreign_key: AtomicBool::new(true),
            job_poll_interval: DEFAULT_JOB_POLL_INTERVAL,
            error_count_limit: DEFAULT_ERROR_COUNT_LIMIT,
        }
    }
}

impl DdlConfig {
    /// Loads configuration from `HOLO_DDL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let enable_foreign_key =
            parse_bool(std::env::var("HOLO_DDL_ENABLE_FOREIGN_KEY").ok(), true)?;
        let poll_ms = parse_u64(
            std::env::var("HOLO_DDL_JOB_POLL_INTERVAL_MS").ok(),
            DEFAULT_JOB_POLL_INTERVAL.as_millis() as u64,
        )?
        .max(1);
        let error_count_limit = parse_u64(
            std::env::var("HOLO_DDL_ERROR_COUNT_LIMIT").ok(),
            DEFAULT_ERROR_COUNT_LIMIT,
        )?;
        Ok(Self {
            enable_foreign_key: AtomicBool::new(enable_foreign_key),
            job_poll_interval: Duration::from_millis(poll_ms),
            error_count_limit,
        })
    }

    pub fn with_error_count_limit(mut self, limit: u64) -> Self {
        self.error_count_limit = limit;
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn foreign_key_enabled(&self) -> bool {
        self.enable_foreign_key.load(Ordering::Acquire)
    }

    pub fn set_foreign_key_enabled(&self, enabled: bool) {
        self.enable_foreign_key.store(enabled, Ordering::Release);
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!("invalid bool value: {raw}")),
        },
        None => Ok(default_value),
    }
}
