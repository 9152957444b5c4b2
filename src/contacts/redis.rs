//! Redis-backed contact event queues.
//!
//! Layout for contact `c` of org `o`:
//!
//! ```text
//! c:o:c:retry     LIST    retried envelopes, popped first
//! c:o:c:pending   LIST    new envelopes
//! c:o:c:handling  STRING  set while a handle task is outstanding, with TTL
//! ```

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::error;

use super::ContactEventQueue;
use crate::error::Result;
use crate::model::{ContactEventEnvelope, ContactId, OrgId};

const PUSH_SCRIPT: &str = r#"
    redis.call("RPUSH", KEYS[1], ARGV[1])
    if redis.call("SET", KEYS[2], "1", "NX", "EX", ARGV[2]) then
        return 1
    end
    return 0
"#;

const POP_SCRIPT: &str = r#"
    local event = redis.call("LPOP", KEYS[1])
    if not event then
        event = redis.call("LPOP", KEYS[2])
    end
    if not event then
        redis.call("DEL", KEYS[3])
        return false
    end
    return event
"#;

#[derive(Clone)]
pub struct RedisContactEvents {
    pool: Pool,
    flag_ttl: Duration,
}

impl RedisContactEvents {
    pub fn new(pool: Pool, flag_ttl: Duration) -> Self {
        Self { pool, flag_ttl }
    }
}

fn keys(org_id: OrgId, contact_id: ContactId) -> [String; 3] {
    let base = format!("c:{org_id}:{contact_id}");
    [
        format!("{base}:retry"),
        format!("{base}:pending"),
        format!("{base}:handling"),
    ]
}

#[async_trait]
impl ContactEventQueue for RedisContactEvents {
    async fn push(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<bool> {
        let [_, pending, handling] = keys(org_id, contact_id);
        let serialized = serde_json::to_string(event)?;
        let mut conn = self.pool.get().await?;

        let flagged: i32 = Script::new(PUSH_SCRIPT)
            .key(pending)
            .key(handling)
            .arg(serialized)
            .arg(self.flag_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(flagged == 1)
    }

    async fn push_retry(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<()> {
        let [retry, _, _] = keys(org_id, contact_id);
        let serialized = serde_json::to_string(event)?;
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.rpush(retry, serialized).await?;
        Ok(())
    }

    async fn pop(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
    ) -> Result<Option<ContactEventEnvelope>> {
        let [retry, pending, handling] = keys(org_id, contact_id);
        let mut conn = self.pool.get().await?;

        loop {
            let raw: Option<String> = Script::new(POP_SCRIPT)
                .key(&retry)
                .key(&pending)
                .key(&handling)
                .invoke_async(&mut conn)
                .await?;

            let Some(raw) = raw else {
                return Ok(None);
            };
            match serde_json::from_str(&raw) {
                Ok(event) => return Ok(Some(event)),
                // skip it so one bad entry can't strand the rest of the queue
                Err(e) => {
                    error!(org_id = %org_id, contact_id = %contact_id, error = %e, data = %raw, "dropping malformed contact event")
                }
            }
        }
    }

    async fn refresh_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()> {
        let [_, _, handling] = keys(org_id, contact_id);
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .set_ex(handling, "1", self.flag_ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn clear_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()> {
        let [_, _, handling] = keys(org_id, contact_id);
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.del(handling).await?;
        Ok(())
    }

    async fn len(&self, org_id: OrgId, contact_id: ContactId) -> Result<usize> {
        let [retry, pending, _] = keys(org_id, contact_id);
        let mut conn = self.pool.get().await?;
        let retries: usize = conn.llen(retry).await?;
        let pending: usize = conn.llen(pending).await?;
        Ok(retries + pending)
    }
}
