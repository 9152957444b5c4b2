//! Redis-backed locks using SET NX with compare-and-act Lua scripts.

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions};
use std::time::Duration;
use tracing::{debug, trace};

use super::{LockToken, Locker, lock_key, next_wait};
use crate::error::Result;

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    end
    return 0
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

#[derive(Clone)]
pub struct RedisLocker {
    pool: Pool,
}

impl RedisLocker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn grab(&self, key: &str, ttl: Duration, timeout: Duration) -> Result<Option<LockToken>> {
        let key = lock_key(key);
        let token = LockToken::generate();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let options = SetOptions::default()
                .conditional_set(ExistenceCheck::NX)
                .with_expiration(SetExpiry::PX(ttl.as_millis() as u64));

            // NX returns OK when the key was set and nil when it already exists
            let set: Option<String> = {
                let mut conn = self.pool.get().await?;
                conn.set_options(&key, token.as_str(), options).await?
            };
            if set.is_some() {
                trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                return Ok(Some(token));
            }

            match next_wait(deadline) {
                Some(wait) => tokio::time::sleep(wait).await,
                None => {
                    debug!(key = %key, "lock held elsewhere, giving up");
                    return Ok(None);
                }
            }
        }
    }

    async fn extend(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let extended: i32 = Script::new(EXTEND_SCRIPT)
            .key(lock_key(key))
            .arg(token.as_str())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let released: i32 = Script::new(RELEASE_SCRIPT)
            .key(lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            debug!(key, "lock no longer ours, nothing released");
        }
        Ok(released == 1)
    }
}
