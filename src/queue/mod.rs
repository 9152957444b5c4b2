//! Named task queues partitioned by org.
//!
//! Every queue keeps a high and a bulk list per org plus an index of orgs that
//! have work. Pop takes the org that was served least recently and returns
//! its oldest high priority task, falling back to its oldest bulk task, so
//! within an org ordering is FIFO per priority. Ordering across orgs is not
//! guaranteed; the org tag on every envelope is what a fairness layer would
//! key on.
//!
//! The queue never redelivers: a popped task is gone whether or not it
//! succeeds.

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::model::{OrgId, Priority, TaskEnvelope};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Queue for large, latency-tolerant work such as campaign fires and big starts.
pub const BATCH_QUEUE: &str = "batch";

/// Queue for small, latency-sensitive work such as per-contact event handling.
pub const HANDLER_QUEUE: &str = "handler";

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, queue: &str, priority: Priority, task: &TaskEnvelope) -> Result<()>;

    /// Pops the next task, or None if the queue is empty.
    async fn pop(&self, queue: &str) -> Result<Option<TaskEnvelope>>;

    /// Number of tasks waiting across all orgs.
    async fn size(&self, queue: &str) -> Result<usize>;
}

/// Wraps a payload in an envelope and pushes it.
pub async fn add_task(
    tasks: &dyn TaskQueue,
    queue: &str,
    task_type: &str,
    org_id: OrgId,
    payload: serde_json::Value,
    priority: Priority,
) -> Result<()> {
    let envelope = TaskEnvelope::new(task_type, org_id, payload);
    tasks.push(queue, priority, &envelope).await?;

    metrics::tasks_queued().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("task_type", task_type.to_string()),
            KeyValue::new("priority", priority.to_string()),
        ],
    );
    debug!(queue, task_type, org_id = %org_id, %priority, "task queued");
    Ok(())
}
