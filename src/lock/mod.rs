//! Expiring mutexes keyed by arbitrary strings.
//!
//! Used as the cron leadership lock and as the per-contact exclusion lock.
//! Acquisition hands back an opaque [`LockToken`]; only the holder of that
//! token can extend or release the lock, and both checks happen atomically on
//! the backend so a lock that expired and was re-acquired by someone else is
//! never touched.

mod memory;
mod redis;

pub use memory::MemoryLocker;
pub use redis::RedisLocker;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Delay between acquisition attempts while waiting for a held lock.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Proof of lock ownership. Only obtainable from a successful grab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Tries to acquire `key` for `ttl`, polling for up to `timeout`.
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere for the whole wait.
    /// That is contention, not an error.
    async fn grab(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<Option<LockToken>>;

    /// Resets the expiry of a lock we still own. Returns false if the lock
    /// has expired or belongs to another token.
    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool>;

    /// Releases a lock we still own. Returns false, and changes nothing, if
    /// the lock belongs to another token.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;
}

pub(crate) fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

/// Sleep before the next attempt, or None once the deadline has passed.
pub(crate) fn next_wait(deadline: tokio::time::Instant) -> Option<Duration> {
    let now = tokio::time::Instant::now();
    if now >= deadline {
        None
    } else {
        Some(RETRY_INTERVAL.min(deadline - now))
    }
}
