//! Tasks that run one batch of a flow start.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::contacts::{extend_contacts, hold_contacts, lock_contacts, unlock_contacts};
use crate::error::Result;
use crate::model::{ContactId, FlowStartBatch, OrgId};
use crate::runtime::Runtime;
use crate::tasks::Task;
use crate::telemetry::metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartFlowBatchTask {
    pub batch: FlowStartBatch,
}

impl StartFlowBatchTask {
    pub const TYPE: &'static str = "start_flow_batch";
}

#[async_trait]
impl Task for StartFlowBatchTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    async fn perform(&self, rt: &Runtime, org_id: OrgId) -> Result<()> {
        let started = start_locked(rt, org_id, &self.batch).await;
        finish_batch(rt, &self.batch, started).await
    }
}

/// A batch of a voice flow start. Calls are only requested here; the flow
/// itself starts when a call connects, so no contact locks are taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartIVRFlowBatchTask {
    pub batch: FlowStartBatch,
}

impl StartIVRFlowBatchTask {
    pub const TYPE: &'static str = "start_ivr_flow_batch";
}

#[async_trait]
impl Task for StartIVRFlowBatchTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn perform(&self, rt: &Runtime, _org_id: OrgId) -> Result<()> {
        let requested = rt
            .runner
            .request_calls(&self.batch, &self.batch.contact_ids)
            .await;
        finish_batch(rt, &self.batch, requested).await
    }
}

/// Starts the batch's contacts in rounds. Each round locks whatever contacts
/// it can, starts those, and unlocks them; busy contacts wait for the next
/// round until the overall lock ceiling passes.
async fn start_locked(
    rt: &Runtime,
    org_id: OrgId,
    batch: &FlowStartBatch,
) -> Result<Vec<ContactId>> {
    let deadline = Instant::now() + rt.limits.batch_lock_ceiling;
    let mut remaining = batch.contact_ids.clone();
    let mut started = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        if Instant::now() >= deadline {
            warn!(
                start_id = %batch.start_id,
                skipped = remaining.len(),
                "unable to lock contacts before deadline, skipping them"
            );
            break;
        }

        let ttl = rt.limits.contact_lock_ttl;
        let (mut locks, mut skipped) = lock_contacts(
            rt.locker.as_ref(),
            org_id,
            &remaining,
            ttl,
            rt.limits.batch_lock_wait,
        )
        .await?;

        // waiting on busy contacts can outlast the locks taken first
        let lost = extend_contacts(rt.locker.as_ref(), org_id, &mut locks, ttl).await?;
        if !lost.is_empty() {
            warn!(start_id = %batch.start_id, lost = lost.len(), "contact locks expired before starting, retrying them");
            skipped.extend(lost);
            skipped.sort_by_key(|id| remaining.iter().position(|r| r == id));
        }

        if !skipped.is_empty() {
            metrics::contact_lock_contention()
                .add(skipped.len() as u64, &[KeyValue::new("context", "batch")]);
            debug!(start_id = %batch.start_id, skipped = skipped.len(), "contacts busy, deferring to next round");
        }

        if !locks.is_empty() {
            let locked: Vec<ContactId> = remaining
                .iter()
                .filter(|id| locks.contains_key(*id))
                .copied()
                .collect();

            let result = hold_contacts(
                rt.locker.as_ref(),
                org_id,
                &locks,
                ttl,
                rt.runner.start_flow_for_contacts(batch, &locked),
            )
            .await;
            unlock_contacts(rt.locker.as_ref(), org_id, &locks).await?;
            started.extend(result?);
        }

        remaining = skipped;
    }

    Ok(started)
}

/// Completes the start when this is its last batch, whether or not this batch
/// succeeded, then reports the batch's own outcome.
async fn finish_batch(
    rt: &Runtime,
    batch: &FlowStartBatch,
    outcome: Result<Vec<ContactId>>,
) -> Result<()> {
    if batch.is_last {
        match rt.starts.mark_start_complete(batch.start_id).await {
            Ok(true) => info!(start_id = %batch.start_id, contacts = batch.total_contacts, "flow start complete"),
            Ok(false) => debug!(start_id = %batch.start_id, "flow start already complete"),
            Err(e) if outcome.is_ok() => return Err(e),
            Err(e) => error!(start_id = %batch.start_id, error = %e, "unable to mark start complete"),
        }
    }

    let started = outcome?;
    info!(
        start_id = %batch.start_id,
        flow_id = %batch.flow_id,
        contacts = batch.contact_ids.len(),
        started = started.len(),
        "flow start batch run"
    );
    Ok(())
}
