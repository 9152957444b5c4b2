//! In-process task queues with the same org rotation as the Redis queues.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

use super::TaskQueue;
use crate::error::Result;
use crate::model::{OrgId, Priority, TaskEnvelope};

#[derive(Default)]
struct OrgTasks {
    high: VecDeque<TaskEnvelope>,
    bulk: VecDeque<TaskEnvelope>,
    served: u64,
}

impl OrgTasks {
    fn len(&self) -> usize {
        self.high.len() + self.bulk.len()
    }
}

#[derive(Default)]
struct Queue {
    orgs: BTreeMap<OrgId, OrgTasks>,
    tick: u64,
}

#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Queue>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push(&self, queue: &str, priority: Priority, task: &TaskEnvelope) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue.to_string()).or_default();
        let tick = queue.tick;
        let org = queue.orgs.entry(task.org_id).or_insert_with(|| OrgTasks {
            served: tick,
            ..Default::default()
        });
        match priority {
            Priority::High => org.high.push_back(task.clone()),
            Priority::Bulk => org.bulk.push_back(task.clone()),
        }
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<TaskEnvelope>> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(queue) else {
            return Ok(None);
        };

        // least recently served org, ties broken by org id
        let Some(org_id) = queue
            .orgs
            .iter()
            .min_by_key(|(id, tasks)| (tasks.served, **id))
            .map(|(id, _)| *id)
        else {
            return Ok(None);
        };

        queue.tick += 1;
        let tick = queue.tick;
        let Some(org) = queue.orgs.get_mut(&org_id) else {
            return Ok(None);
        };
        let task = org.high.pop_front().or_else(|| org.bulk.pop_front());
        if org.len() == 0 {
            queue.orgs.remove(&org_id);
        } else {
            org.served = tick;
        }
        Ok(task)
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| q.orgs.values().map(OrgTasks::len).sum())
            .unwrap_or(0))
    }
}
