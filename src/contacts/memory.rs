//! In-process contact event queues with an expiring handler flag.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::ContactEventQueue;
use crate::error::Result;
use crate::model::{ContactEventEnvelope, ContactId, OrgId};

#[derive(Default)]
struct ContactQueue {
    retry: VecDeque<ContactEventEnvelope>,
    pending: VecDeque<ContactEventEnvelope>,
    handling_until: Option<Instant>,
}

pub struct MemoryContactEvents {
    queues: Mutex<HashMap<(OrgId, ContactId), ContactQueue>>,
    flag_ttl: Duration,
}

impl MemoryContactEvents {
    pub fn new(flag_ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            flag_ttl,
        }
    }
}

#[async_trait]
impl ContactEventQueue for MemoryContactEvents {
    async fn push(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let queue = queues.entry((org_id, contact_id)).or_default();
        queue.pending.push_back(event.clone());

        match queue.handling_until {
            Some(until) if until > now => Ok(false),
            _ => {
                queue.handling_until = Some(now + self.flag_ttl);
                Ok(true)
            }
        }
    }

    async fn push_retry(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry((org_id, contact_id))
            .or_default()
            .retry
            .push_back(event.clone());
        Ok(())
    }

    async fn pop(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
    ) -> Result<Option<ContactEventEnvelope>> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(&(org_id, contact_id)) else {
            return Ok(None);
        };
        let event = queue.retry.pop_front().or_else(|| queue.pending.pop_front());
        if event.is_none() {
            queues.remove(&(org_id, contact_id));
        }
        Ok(event)
    }

    async fn refresh_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues.entry((org_id, contact_id)).or_default().handling_until =
            Some(Instant::now() + self.flag_ttl);
        Ok(())
    }

    async fn clear_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(&(org_id, contact_id)) {
            queue.handling_until = None;
        }
        Ok(())
    }

    async fn len(&self, org_id: OrgId, contact_id: ContactId) -> Result<usize> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&(org_id, contact_id))
            .map(|q| q.retry.len() + q.pending.len())
            .unwrap_or(0))
    }
}
