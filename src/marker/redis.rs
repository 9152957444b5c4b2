//! Redis-backed marker sets.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use deadpool_redis::redis::Script;
use tracing::trace;

use super::{MARKER_EXPIRY, MarkerSet, bucket_keys};
use crate::error::Result;

const CONTAINS_SCRIPT: &str = r#"
    if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 1 then
        return 1
    end
    return redis.call("SISMEMBER", KEYS[2], ARGV[1])
"#;

/// Marker sets stored as Redis sets with a day-long expiry.
#[derive(Clone)]
pub struct RedisMarkers {
    pool: Pool,
}

impl RedisMarkers {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarkerSet for RedisMarkers {
    async fn contains(&self, group: &str, id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let [today, yesterday] = bucket_keys(group, Utc::now());

        let found: i32 = Script::new(CONTAINS_SCRIPT)
            .key(&today)
            .key(&yesterday)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        Ok(found == 1)
    }

    async fn add(&self, group: &str, id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let [today, _] = bucket_keys(group, Utc::now());

        deadpool_redis::redis::pipe()
            .atomic()
            .sadd(&today, id)
            .ignore()
            .expire(&today, MARKER_EXPIRY.as_secs() as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        trace!(group, id, key = %today, "marked");
        Ok(())
    }

    async fn remove(&self, group: &str, id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let [today, yesterday] = bucket_keys(group, Utc::now());

        deadpool_redis::redis::pipe()
            .atomic()
            .srem(&today, id)
            .ignore()
            .srem(&yesterday, id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        trace!(group, id, "unmarked");
        Ok(())
    }

    async fn clear(&self, group: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let [today, yesterday] = bucket_keys(group, Utc::now());

        deadpool_redis::redis::pipe()
            .atomic()
            .del(&today)
            .ignore()
            .del(&yesterday)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }
}
