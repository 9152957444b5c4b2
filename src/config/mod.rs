//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Connection strings are wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub redis_url: SecretString,
    pub engine_url: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Concurrent workers popping from the batch queue.
    pub batch_workers: usize,
    /// Concurrent workers popping from the handler queue.
    pub handler_workers: usize,
    pub limits: Limits,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            engine_url: required_var("ENGINE_URL")?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            batch_workers: parsed_var("BATCH_WORKERS", 4)?,
            handler_workers: parsed_var("HANDLER_WORKERS", 8)?,
            limits: Limits::default(),
        })
    }
}

/// Tunable sizes and timeouts used by the scanners and tasks.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum fire IDs carried by one campaign fire task.
    pub fire_batch_size: usize,
    /// Maximum due fires read by one campaign scan.
    pub fire_scan_limit: usize,
    /// Maximum contacts carried by one flow start batch.
    pub start_batch_size: usize,
    /// Audiences at or below this size go to the handler queue.
    pub handler_queue_threshold: usize,
    /// Handling attempts for one contact event before it is dropped.
    pub contact_event_max_attempts: u32,
    /// How long a handle task waits for its contact lock.
    pub contact_lock_wait: Duration,
    /// Expiry of a contact lock.
    pub contact_lock_ttl: Duration,
    /// Per-contact lock wait inside a start batch round.
    pub batch_lock_wait: Duration,
    /// Overall wall-clock ceiling for locking a start batch's contacts.
    pub batch_lock_ceiling: Duration,
    /// Expiry of the per-contact "handler outstanding" flag. Re-armed each
    /// time a handle task is queued and while one is draining.
    pub handler_flag_ttl: Duration,
    /// Longest a single contact event handler may run before it counts as a
    /// failed attempt.
    pub contact_event_timeout: Duration,
    /// How long one handle task keeps draining before it hands the rest of
    /// the queue to a fresh handle task. Must leave room for one more event
    /// inside the handle task's own timeout.
    pub contact_drain_budget: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            fire_batch_size: 100,
            fire_scan_limit: 25_000,
            start_batch_size: 100,
            handler_queue_threshold: 2,
            contact_event_max_attempts: 3,
            contact_lock_wait: Duration::from_secs(10),
            contact_lock_ttl: Duration::from_secs(60),
            batch_lock_wait: Duration::from_secs(1),
            batch_lock_ceiling: Duration::from_secs(5 * 60),
            handler_flag_ttl: Duration::from_secs(15 * 60),
            contact_event_timeout: Duration::from_secs(60),
            contact_drain_budget: Duration::from_secs(3 * 60),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(0) | Err(_) => Err(Error::Config(format!(
                "{name} must be a positive integer, got {raw:?}"
            ))),
            Ok(n) => Ok(n),
        },
        Err(_) => Ok(default),
    }
}
