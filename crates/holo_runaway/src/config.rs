//! Runaway-query subsystem configuration.

use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_WATCH_LIST_CAPACITY: usize = 10_000;
const DEFAULT_RECORD_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_RECORD_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_GC_BATCH_SIZE: usize = 100;
const DEFAULT_WATCH_SYNC_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_STALE_CLEANUP_RETRIES: usize = 3;
const DEFAULT_STALE_CLEANUP_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SERVER_ID: &str = "local";

/// Settings for the watch manager and its background pipeline.
#[derive(Debug, Clone)]
pub struct RunawayConfig {
    /// Maximum number of live watch entries kept in memory.
    pub watch_list_capacity: usize,
    /// Capacity of the record, quarantine and stale channels.
    pub record_channel_capacity: usize,
    pub flush_interval: Duration,
    pub gc_interval: Duration,
    /// Records older than this are deleted from `mysql.holo_runaway_queries`.
    pub record_retention: Duration,
    pub gc_batch_size: usize,
    pub watch_sync_interval: Duration,
    /// Total attempts for moving one stale watch to the done table.
    pub stale_cleanup_retries: usize,
    pub stale_cleanup_backoff: Duration,
    pub cache_purge_interval: Duration,
    /// Recorded as the `source` of machine-detected records.
    pub server_id: String,
}

impl Default for RunawayConfig {
    fn default() -> Self {
        Self {
            watch_list_capacity: DEFAULT_WATCH_LIST_CAPACITY,
            record_channel_capacity: DEFAULT_RECORD_CHANNEL_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            gc_interval: DEFAULT_GC_INTERVAL,
            record_retention: DEFAULT_RECORD_RETENTION,
            gc_batch_size: DEFAULT_GC_BATCH_SIZE,
            watch_sync_interval: DEFAULT_WATCH_SYNC_INTERVAL,
            stale_cleanup_retries: DEFAULT_STALE_CLEANUP_RETRIES,
            stale_cleanup_backoff: DEFAULT_STALE_CLEANUP_BACKOFF,
            cache_purge_interval: DEFAULT_CACHE_PURGE_INTERVAL,
            server_id: DEFAULT_SERVER_ID.to_string(),
        }
    }
}

impl RunawayConfig {
    /// Loads configuration from `HOLO_RUNAWAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            watch_list_capacity: parse_usize(
                std::env::var("HOLO_RUNAWAY_WATCH_LIST_CAPACITY").ok(),
                defaults.watch_list_capacity,
            )?
            .max(1),
            record_channel_capacity: parse_usize(
                std::env::var("HOLO_RUNAWAY_RECORD_CHANNEL_CAPACITY").ok(),
                defaults.record_channel_capacity,
            )?
            .max(2),
            flush_interval: parse_millis(
                std::env::var("HOLO_RUNAWAY_FLUSH_INTERVAL_MS").ok(),
                defaults.flush_interval,
            )?,
            gc_interval: parse_millis(
                std::env::var("HOLO_RUNAWAY_GC_INTERVAL_MS").ok(),
                defaults.gc_interval,
            )?,
            record_retention: parse_millis(
                std::env::var("HOLO_RUNAWAY_RECORD_RETENTION_MS").ok(),
                defaults.record_retention,
            )?,
            gc_batch_size: parse_usize(
                std::env::var("HOLO_RUNAWAY_GC_BATCH_SIZE").ok(),
                defaults.gc_batch_size,
            )?
            .max(1),
            watch_sync_interval: parse_millis(
                std::env::var("HOLO_RUNAWAY_WATCH_SYNC_INTERVAL_MS").ok(),
                defaults.watch_sync_interval,
            )?,
            stale_cleanup_retries: parse_usize(
                std::env::var("HOLO_RUNAWAY_STALE_CLEANUP_RETRIES").ok(),
                defaults.stale_cleanup_retries,
            )?
            .max(1),
            stale_cleanup_backoff: parse_millis(
                std::env::var("HOLO_RUNAWAY_STALE_CLEANUP_BACKOFF_MS").ok(),
                defaults.stale_cleanup_backoff,
            )?,
            cache_purge_interval: parse_millis(
                std::env::var("HOLO_RUNAWAY_CACHE_PURGE_INTERVAL_MS").ok(),
                defaults.cache_purge_interval,
            )?,
            server_id: std::env::var("HOLO_RUNAWAY_SERVER_ID").unwrap_or(defaults.server_id),
        })
    }

    /// Buffered records are flushed once this many distinct keys accumulate.
    pub fn flush_threshold(&self) -> usize {
        (self.record_channel_capacity / 2).max(1)
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_millis(value: Option<String>, default_value: Duration) -> Result<Duration> {
    match value {
        Some(raw) => {
            let ms = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid millisecond value: {raw}"))?;
            Ok(Duration::from_millis(ms.max(1)))
        }
        None => Ok(default_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_threshold_is_half_the_channel() {
        let cfg = RunawayConfig::default();
        assert_eq!(cfg.flush_threshold(), 512);
        let tiny = RunawayConfig {
            record_channel_capacity: 1,
            ..RunawayConfig::default()
        };
        assert_eq!(tiny.flush_threshold(), 1);
    }

    #[test]
    fn duration_parser_rejects_garbage_and_clamps_zero() {
        assert!(parse_millis(Some("soon".into()), DEFAULT_FLUSH_INTERVAL).is_err());
        assert_eq!(
            parse_millis(Some("0".into()), DEFAULT_FLUSH_INTERVAL).unwrap(),
            Duration::from_millis(1)
        );
        assert_eq!(parse_millis(None, DEFAULT_GC_INTERVAL).unwrap(), DEFAULT_GC_INTERVAL);
    }
}
