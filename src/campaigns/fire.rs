//! The task that fires one chunk of a campaign event.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::marker::CAMPAIGN_EVENT_GROUP;
use crate::model::{CampaignEventId, ContactId, EventFire, FireId, FireResult, OrgId};
use crate::runtime::Runtime;
use crate::tasks::Task;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FireCampaignEventTask {
    pub event_id: CampaignEventId,
    pub fire_ids: Vec<FireId>,
}

impl FireCampaignEventTask {
    pub const TYPE: &'static str = "fire_campaign_event";
}

#[async_trait]
impl Task for FireCampaignEventTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    /// Five minutes plus a minute per fire.
    fn timeout(&self) -> Duration {
        Duration::from_secs(5 * 60) + Duration::from_secs(60) * self.fire_ids.len() as u32
    }

    async fn perform(&self, rt: &Runtime, org_id: OrgId) -> Result<()> {
        let fires = match rt.fires.load_event_fires(&self.fire_ids).await {
            Ok(fires) => fires,
            Err(e) => {
                unmark(rt, &self.fire_ids).await;
                return Err(e);
            }
        };

        // a duplicate delivery after everything was already fired
        let Some(first) = fires.first() else {
            debug!(event_id = %self.event_id, "no unfired fires left, nothing to do");
            return Ok(());
        };
        let loaded: Vec<FireId> = fires.iter().map(|f| f.fire_id).collect();

        let result = rt
            .runner
            .fire_campaign_events(
                org_id,
                &fires,
                first.flow_uuid,
                &first.campaign,
                first.event_uuid,
            )
            .await;

        match result {
            Ok(started) => {
                let started: HashSet<ContactId> = started.into_iter().collect();
                let (fired, unstarted): (Vec<&EventFire>, Vec<&EventFire>) =
                    fires.iter().partition(|f| started.contains(&f.contact_id));

                // rows the engine already recorded keep their result
                let fired: Vec<(FireId, FireResult)> =
                    fired.iter().map(|f| (f.fire_id, FireResult::Fired)).collect();
                rt.fires.mark_events_fired(&fired, Utc::now()).await?;

                let unstarted: Vec<FireId> = unstarted.iter().map(|f| f.fire_id).collect();
                unmark(rt, &unstarted).await;

                info!(
                    org_id = %org_id,
                    event_id = %self.event_id,
                    fires = fires.len(),
                    started = started.len(),
                    "fired campaign event"
                );
                Ok(())
            }
            Err(Error::FlowInactive(reason)) => {
                info!(
                    org_id = %org_id,
                    event_id = %self.event_id,
                    %reason,
                    "campaign event no longer active, deleting fires"
                );
                rt.fires.delete_event_fires(&loaded).await?;
                unmark(rt, &loaded).await;
                Ok(())
            }
            Err(e) => {
                unmark(rt, &loaded).await;
                Err(e)
            }
        }
    }
}

/// Unmarks fires so the next scan queues them again. Failures are logged
/// only; the fire row stays unfired either way.
async fn unmark(rt: &Runtime, fire_ids: &[FireId]) {
    for fire_id in fire_ids {
        if let Err(e) = rt
            .markers
            .remove(CAMPAIGN_EVENT_GROUP, &fire_id.to_string())
            .await
        {
            error!(fire_id = %fire_id, error = %e, "unable to unmark campaign event fire");
        }
    }
}
