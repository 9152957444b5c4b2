//! Campaign event firing.
//!
//! A cron scans for due, unfired event fires and queues them as
//! [`FireCampaignEventTask`]s, one per run of consecutive fires for the same
//! event, chunked to a bounded size. Fires are marked in the marker set once
//! their task is queued so later scans skip them until they are fired or
//! unmarked. The fire row, not the marker, says whether work is outstanding.

mod fire;

pub use fire::FireCampaignEventTask;

use opentelemetry::KeyValue;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::Result;
use crate::marker::CAMPAIGN_EVENT_GROUP;
use crate::model::{CampaignEventId, FireId, OrgId, Priority};
use crate::queue::BATCH_QUEUE;
use crate::runtime::Runtime;
use crate::tasks::queue_task;
use crate::telemetry::metrics;

/// Name of the scanning cron.
pub const SCAN_CRON: &str = "campaign_event_fires";

/// How often due fires are scanned for.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// What a scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Fires queued in this scan.
    pub queued: usize,
    /// Fires skipped because an earlier scan already queued them.
    pub dupes: usize,
    /// Fire tasks queued.
    pub tasks: usize,
}

/// Queues fire tasks for every due fire not already queued.
///
/// Any store or queue error aborts the scan. Chunks queued before the error
/// stay marked and are skipped by the next scan.
pub async fn queue_event_fires(rt: &Runtime) -> Result<ScanStats> {
    let started = Instant::now();
    let fires = rt.fires.select_due_fires(rt.limits.fire_scan_limit).await?;

    let mut stats = ScanStats::default();
    let mut group: Option<(OrgId, CampaignEventId)> = None;
    let mut fire_ids: Vec<FireId> = Vec::new();

    for fire in fires {
        if rt
            .markers
            .contains(CAMPAIGN_EVENT_GROUP, &fire.fire_id.to_string())
            .await?
        {
            stats.dupes += 1;
            continue;
        }

        match group {
            Some((org_id, event_id)) if event_id != fire.event_id => {
                queue_fires(rt, org_id, event_id, &fire_ids, &mut stats).await?;
                fire_ids.clear();
            }
            _ => {}
        }

        group = Some((fire.org_id, fire.event_id));
        fire_ids.push(fire.fire_id);
    }

    if let Some((org_id, event_id)) = group {
        queue_fires(rt, org_id, event_id, &fire_ids, &mut stats).await?;
    }

    metrics::campaign_fires().add(stats.queued as u64, &[KeyValue::new("result", "queued")]);
    metrics::campaign_fires().add(stats.dupes as u64, &[KeyValue::new("result", "duplicate")]);
    info!(
        queued = stats.queued,
        dupes = stats.dupes,
        tasks = stats.tasks,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "queued campaign event fires"
    );
    Ok(stats)
}

/// Queues one event's fires in bounded chunks, marking each chunk after it
/// is queued.
async fn queue_fires(
    rt: &Runtime,
    org_id: OrgId,
    event_id: CampaignEventId,
    fire_ids: &[FireId],
    stats: &mut ScanStats,
) -> Result<()> {
    for chunk in fire_ids.chunks(rt.limits.fire_batch_size.max(1)) {
        let task = FireCampaignEventTask {
            event_id,
            fire_ids: chunk.to_vec(),
        };
        queue_task(rt, BATCH_QUEUE, org_id, &task, Priority::Bulk).await?;

        for fire_id in chunk {
            rt.markers
                .add(CAMPAIGN_EVENT_GROUP, &fire_id.to_string())
                .await?;
        }
        stats.queued += chunk.len();
        stats.tasks += 1;
    }
    Ok(())
}
