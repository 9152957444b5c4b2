//! Flow starts: resolving an audience and fanning it out into batches.
//!
//! A [`StartFlowTask`] resolves who a start targets, records the count, and
//! queues the audience as bounded [`StartFlowBatchTask`]s (or
//! [`StartIVRFlowBatchTask`]s for voice flows). Only the last batch moves the
//! start to complete.

mod batch;

pub use batch::{StartFlowBatchTask, StartIVRFlowBatchTask};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::model::{ContactId, FlowStart, FlowType, OrgId, Priority, StartType};
use crate::queue::{BATCH_QUEUE, HANDLER_QUEUE};
use crate::runtime::Runtime;
use crate::tasks::{Task, queue_task};

/// Queues a flow start to be resolved and batched.
///
/// Starts for a couple of explicit contacts go straight to the handler queue
/// at high priority.
pub async fn queue_flow_start(rt: &Runtime, start: &FlowStart) -> Result<()> {
    let (queue, priority) = queue_for(start.is_small(rt.limits.handler_queue_threshold));
    let task = StartFlowTask {
        start: start.clone(),
    };
    queue_task(rt, queue, start.org_id, &task, priority).await
}

fn queue_for(small: bool) -> (&'static str, Priority) {
    if small {
        (HANDLER_QUEUE, Priority::High)
    } else {
        (BATCH_QUEUE, Priority::Bulk)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartFlowTask {
    pub start: FlowStart,
}

impl StartFlowTask {
    pub const TYPE: &'static str = "start_flow";
}

#[async_trait]
impl Task for StartFlowTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    async fn perform(&self, rt: &Runtime, _org_id: OrgId) -> Result<()> {
        let start = &self.start;
        let Err(e) = create_batches(rt, start).await else {
            return Ok(());
        };

        if let Err(mark_err) = rt.starts.mark_start_failed(start.id).await {
            error!(start_id = %start.id, error = %mark_err, "unable to mark start failed");
        }

        if e.is_user_error() {
            warn!(start_id = %start.id, error = %e, "flow start failed");
            return Ok(());
        }
        Err(e)
    }
}

async fn create_batches(rt: &Runtime, start: &FlowStart) -> Result<()> {
    let contact_ids = resolve_audience(rt, start).await?;
    let total = contact_ids.len();

    rt.starts.mark_start_started(start.id, total).await?;

    if contact_ids.is_empty() {
        rt.starts.mark_start_complete(start.id).await?;
        info!(start_id = %start.id, "flow start has no contacts, completed");
        return Ok(());
    }

    let (queue, priority) = queue_for(total <= rt.limits.handler_queue_threshold);
    let chunks: Vec<&[ContactId]> = contact_ids.chunks(rt.limits.start_batch_size.max(1)).collect();
    let last = chunks.len() - 1;

    for (i, chunk) in chunks.into_iter().enumerate() {
        let batch = start.create_batch(chunk.to_vec(), i == last, total);
        match start.flow_type {
            FlowType::Messaging => {
                queue_task(rt, queue, start.org_id, &StartFlowBatchTask { batch }, priority).await?
            }
            FlowType::Voice => {
                queue_task(rt, queue, start.org_id, &StartIVRFlowBatchTask { batch }, priority)
                    .await?
            }
        }
    }

    info!(
        start_id = %start.id,
        flow_id = %start.flow_id,
        contacts = total,
        batches = last + 1,
        queue,
        "flow start batched"
    );
    Ok(())
}

/// Resolves the contacts a start targets, each once, in first-seen order.
async fn resolve_audience(rt: &Runtime, start: &FlowStart) -> Result<Vec<ContactId>> {
    if start.create_contact {
        return Ok(vec![rt.starts.create_contact(start.org_id).await?]);
    }

    let mut contact_ids = start.contact_ids.clone();

    if !start.group_ids.is_empty() {
        contact_ids.extend(
            rt.starts
                .group_contact_ids(start.org_id, &start.group_ids)
                .await?,
        );
    }

    if let Some(query) = start.query.as_deref() {
        let limit = (start.start_type == StartType::FlowAction).then_some(1);
        contact_ids.extend(rt.resolver.resolve_query(start.org_id, query, limit).await?);
    }

    let mut seen = HashSet::with_capacity(contact_ids.len());
    contact_ids.retain(|id| seen.insert(*id));

    if !start.exclude_group_ids.is_empty() {
        let excluded = rt
            .starts
            .group_contact_ids(start.org_id, &start.exclude_group_ids)
            .await?;
        remove_all(&mut contact_ids, excluded);
    }

    if !start.restart_participants && !contact_ids.is_empty() {
        let started = rt
            .starts
            .find_flow_started_overlap(start.flow_id, &contact_ids)
            .await?;
        remove_all(&mut contact_ids, started);
    }

    if !start.include_active && !contact_ids.is_empty() {
        let active = rt
            .starts
            .find_active_session_overlap(start.org_id, start.flow_type, &contact_ids)
            .await?;
        remove_all(&mut contact_ids, active);
    }

    Ok(contact_ids)
}

fn remove_all(contact_ids: &mut Vec<ContactId>, remove: Vec<ContactId>) {
    if remove.is_empty() {
        return;
    }
    let remove: HashSet<ContactId> = remove.into_iter().collect();
    contact_ids.retain(|id| !remove.contains(id));
}
