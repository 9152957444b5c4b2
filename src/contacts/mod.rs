//! Serialized per-contact event handling.
//!
//! Events for a contact are appended to that contact's own queue and a single
//! handle task is queued to drain it. The queue carries a TTL'd "handler
//! outstanding" flag: a push only asks for a new handle task when the flag was
//! not already set, and the pop that finds the queue empty clears it. So at
//! most one handle task per contact is outstanding, and events stranded by a
//! crashed handler are picked up again once the flag expires. The flag is
//! re-armed whenever a handle task is queued and while one is draining.
//!
//! A handle task drains for a bounded time and then hands whatever is left to
//! a fresh handle task, so it always finishes inside its own timeout with the
//! contact lock released.
//!
//! Each contact queue has two levels. Retried events go on the retry list and
//! are popped before anything on the pending list, in the order they were
//! retried.

pub mod locks;
mod memory;
mod redis;

pub use locks::{
    contact_lock_key, extend_contacts, hold_contacts, lock_contacts, unlock_contacts,
};
pub use memory::MemoryContactEvents;
pub use redis::RedisContactEvents;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{ContactEvent, ContactEventEnvelope, ContactId, OrgId, Priority};
use crate::queue::HANDLER_QUEUE;
use crate::runtime::Runtime;
use crate::tasks::{Task, queue_task};
use crate::telemetry::metrics;

#[async_trait]
pub trait ContactEventQueue: Send + Sync {
    /// Appends an event to the contact's pending list. Returns true if no
    /// handler was outstanding, in which case the caller must queue one.
    async fn push(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<bool>;

    /// Appends an event to the contact's retry list. Leaves the handler flag
    /// alone; the handler doing the retry is still outstanding.
    async fn push_retry(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ContactEventEnvelope,
    ) -> Result<()>;

    /// Pops the next retry, else the next pending event. When both lists are
    /// empty, clears the handler flag and returns None.
    async fn pop(&self, org_id: OrgId, contact_id: ContactId)
    -> Result<Option<ContactEventEnvelope>>;

    /// Sets the handler flag, or pushes out its expiry, for another full TTL.
    async fn refresh_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()>;

    /// Clears the handler flag so the next push asks for a handle task.
    async fn clear_flag(&self, org_id: OrgId, contact_id: ContactId) -> Result<()>;

    /// Events waiting across both lists.
    async fn len(&self, org_id: OrgId, contact_id: ContactId) -> Result<usize>;
}

/// Adds an event to a contact's queue, queueing a handle task if none is
/// outstanding.
pub async fn queue_contact_event(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    event: ContactEvent,
) -> Result<()> {
    let kind = event.kind();
    let envelope = ContactEventEnvelope::new(event);
    if rt.contact_events.push(org_id, contact_id, &envelope).await? {
        queue_handle_task(rt, org_id, contact_id).await?;
    }
    debug!(org_id = %org_id, contact_id = %contact_id, event = kind, "contact event queued");
    Ok(())
}

/// Queues a pointer task that drains the contact's event queue.
///
/// Re-arms the handler flag first, so the flag lasts as long as the task
/// sits in the queue. If the task can't be queued the flag is cleared again,
/// letting the next event ask for a handler instead of waiting out the TTL.
pub async fn queue_handle_task(rt: &Runtime, org_id: OrgId, contact_id: ContactId) -> Result<()> {
    rt.contact_events.refresh_flag(org_id, contact_id).await?;

    let queued = queue_task(
        rt,
        HANDLER_QUEUE,
        org_id,
        &HandleContactEventTask { contact_id },
        Priority::High,
    )
    .await;

    if let Err(e) = &queued {
        error!(org_id = %org_id, contact_id = %contact_id, error = %e, "unable to queue handle task");
        if let Err(e) = rt.contact_events.clear_flag(org_id, contact_id).await {
            error!(org_id = %org_id, contact_id = %contact_id, error = %e, "unable to clear handler flag");
        }
    }
    queued
}

/// Drains one contact's event queue under the contact lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleContactEventTask {
    pub contact_id: ContactId,
}

/// How a drain ended.
enum Drain {
    /// The queue is empty and the handler flag cleared.
    Empty,
    /// Work remains; another handle task must be queued after the lock is
    /// released.
    Deferred,
}

impl HandleContactEventTask {
    pub const TYPE: &'static str = "handle_contact_event";

    async fn drain(&self, rt: &Runtime, org_id: OrgId, lock: &locks::ContactLock) -> Result<Drain> {
        let contact_id = self.contact_id;
        let deadline = Instant::now() + rt.limits.contact_drain_budget;

        loop {
            if Instant::now() >= deadline {
                debug!(org_id = %org_id, contact_id = %contact_id, "drain budget spent, handing off");
                return Ok(Drain::Deferred);
            }

            rt.contact_events.refresh_flag(org_id, contact_id).await?;
            let Some(mut envelope) = rt.contact_events.pop(org_id, contact_id).await? else {
                return Ok(Drain::Empty);
            };
            let kind = envelope.event.kind();

            let timeout = rt.limits.contact_event_timeout;
            let handled = lock
                .hold(
                    rt,
                    tokio::time::timeout(timeout, handle_event(rt, org_id, contact_id, &envelope.event)),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(Error::TaskTimeout {
                        task_type: format!("{}:{kind}", Self::TYPE),
                        timeout,
                    })
                });

            if let Err(e) = handled {
                envelope.error_count += 1;

                if envelope.error_count < rt.limits.contact_event_max_attempts {
                    warn!(
                        org_id = %org_id,
                        contact_id = %contact_id,
                        event = kind,
                        attempt = envelope.error_count,
                        error = %e,
                        "contact event failed, retrying"
                    );
                    metrics::contact_event_failures().add(
                        1,
                        &[
                            KeyValue::new("event", kind),
                            KeyValue::new("outcome", "retried"),
                        ],
                    );
                    rt.contact_events
                        .push_retry(org_id, contact_id, &envelope)
                        .await?;
                    return Ok(Drain::Deferred);
                }

                error!(
                    org_id = %org_id,
                    contact_id = %contact_id,
                    event = kind,
                    attempts = envelope.error_count,
                    error = %e,
                    "contact event failed permanently, dropping"
                );
                metrics::contact_event_failures().add(
                    1,
                    &[
                        KeyValue::new("event", kind),
                        KeyValue::new("outcome", "dropped"),
                    ],
                );
            }

            if !lock.extend(rt).await? {
                warn!(org_id = %org_id, contact_id = %contact_id, "lost contact lock mid-drain");
                return Ok(Drain::Deferred);
            }
        }
    }
}

#[async_trait]
impl Task for HandleContactEventTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn perform(&self, rt: &Runtime, org_id: OrgId) -> Result<()> {
        let Some(lock) = locks::ContactLock::grab(rt, org_id, self.contact_id).await? else {
            // someone else holds the contact, try again later
            metrics::contact_lock_contention().add(1, &[KeyValue::new("context", "handler")]);
            info!(org_id = %org_id, contact_id = %self.contact_id, "contact locked, requeueing handler");
            return queue_handle_task(rt, org_id, self.contact_id).await;
        };

        let drained = self.drain(rt, org_id, &lock).await;
        lock.release(rt).await;

        match drained? {
            Drain::Empty => Ok(()),
            Drain::Deferred => queue_handle_task(rt, org_id, self.contact_id).await,
        }
    }
}

async fn handle_event(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    event: &ContactEvent,
) -> Result<()> {
    let handlers = rt.handlers.as_ref();
    match event {
        ContactEvent::Msg(e) => handlers.handle_msg(org_id, contact_id, e).await,
        ContactEvent::Channel(e) => handlers.handle_channel_event(org_id, contact_id, e).await,
        ContactEvent::Stop(e) => handlers.handle_stop(org_id, contact_id, e).await,
        ContactEvent::TicketClosed(e) => handlers.handle_ticket_closed(org_id, contact_id, e).await,
        ContactEvent::Timed(e) => handlers.handle_timed(org_id, contact_id, e).await,
    }
}
