//! Redis-backed task queues.
//!
//! Layout for a queue named `q`:
//!
//! ```text
//! q:active     ZSET  org id -> tick it was last served (lowest is popped next)
//! q:tick       STRING monotonically increasing pop counter
//! q:{org}/1    LIST  high priority envelopes
//! q:{org}/0    LIST  bulk priority envelopes
//! ```

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::Script;
use tracing::{error, trace};

use super::TaskQueue;
use crate::error::Result;
use crate::model::{Priority, TaskEnvelope};

const PUSH_SCRIPT: &str = r#"
    local tick = tonumber(redis.call("GET", KEYS[2]) or "0")
    redis.call("RPUSH", ARGV[1] .. ":" .. ARGV[2] .. "/" .. ARGV[3], ARGV[4])
    redis.call("ZADD", KEYS[1], "NX", tick, ARGV[2])
    return 1
"#;

const POP_SCRIPT: &str = r#"
    while true do
        local orgs = redis.call("ZRANGE", KEYS[1], 0, 0)
        if #orgs == 0 then
            return false
        end
        local org = orgs[1]
        local high = ARGV[1] .. ":" .. org .. "/1"
        local bulk = ARGV[1] .. ":" .. org .. "/0"

        local task = redis.call("LPOP", high)
        if not task then
            task = redis.call("LPOP", bulk)
        end

        if redis.call("LLEN", high) + redis.call("LLEN", bulk) == 0 then
            redis.call("ZREM", KEYS[1], org)
        else
            redis.call("ZADD", KEYS[1], redis.call("INCR", KEYS[2]), org)
        end

        if task then
            return task
        end
    end
"#;

const SIZE_SCRIPT: &str = r#"
    local total = 0
    for _, org in ipairs(redis.call("ZRANGE", KEYS[1], 0, -1)) do
        total = total + redis.call("LLEN", ARGV[1] .. ":" .. org .. "/1")
        total = total + redis.call("LLEN", ARGV[1] .. ":" .. org .. "/0")
    end
    return total
"#;

#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
}

impl RedisQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn priority_suffix(priority: Priority) -> u8 {
    match priority {
        Priority::High => 1,
        Priority::Bulk => 0,
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn push(&self, queue: &str, priority: Priority, task: &TaskEnvelope) -> Result<()> {
        let serialized = serde_json::to_string(task)?;
        let mut conn = self.pool.get().await?;

        Script::new(PUSH_SCRIPT)
            .key(format!("{queue}:active"))
            .key(format!("{queue}:tick"))
            .arg(queue)
            .arg(task.org_id.0)
            .arg(priority_suffix(priority))
            .arg(serialized)
            .invoke_async::<i32>(&mut conn)
            .await?;

        trace!(queue, org_id = %task.org_id, "pushed task");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<TaskEnvelope>> {
        let mut conn = self.pool.get().await?;

        let raw: Option<String> = Script::new(POP_SCRIPT)
            .key(format!("{queue}:active"))
            .key(format!("{queue}:tick"))
            .arg(queue)
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                // The envelope is gone from the queue either way; report it loudly.
                error!(queue, error = %e, data = %raw, "dropping malformed task envelope");
                Err(e.into())
            }
        }
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let size: i64 = Script::new(SIZE_SCRIPT)
            .key(format!("{queue}:active"))
            .arg(queue)
            .invoke_async(&mut conn)
            .await?;
        Ok(size.max(0) as usize)
    }
}
