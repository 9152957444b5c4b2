//! Event fire queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Db, FireStore, raw_ids};
use crate::error::Result;
use crate::model::{
    CampaignEventId, CampaignRef, ContactId, DueFire, EventFire, FireId, FireResult, OrgId,
};

const SELECT_DUE_FIRES: &str = "
SELECT f.id, f.event_id, c.org_id, f.scheduled
  FROM event_fires f
  JOIN campaign_events e ON e.id = f.event_id
  JOIN campaigns c ON c.id = e.campaign_id
 WHERE f.fired IS NULL AND f.scheduled <= NOW()
 ORDER BY date_trunc('minute', f.scheduled), f.event_id
 LIMIT $1";

const LOAD_EVENT_FIRES: &str = "
SELECT f.id, f.event_id, e.uuid AS event_uuid, c.uuid AS campaign_uuid, c.name AS campaign_name,
       e.flow_uuid, c.org_id, f.contact_id, f.scheduled, f.fired, f.fired_result
  FROM event_fires f
  JOIN campaign_events e ON e.id = f.event_id
  JOIN campaigns c ON c.id = e.campaign_id
 WHERE f.id = ANY($1) AND f.fired IS NULL
 ORDER BY f.id";

#[async_trait]
impl FireStore for Db {
    async fn select_due_fires(&self, limit: usize) -> Result<Vec<DueFire>> {
        let rows = sqlx::query(SELECT_DUE_FIRES)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| -> Result<DueFire> {
                Ok(DueFire {
                    fire_id: FireId(row.try_get("id")?),
                    event_id: CampaignEventId(row.try_get("event_id")?),
                    org_id: OrgId(row.try_get("org_id")?),
                    scheduled: row.try_get("scheduled")?,
                })
            })
            .collect()
    }

    async fn load_event_fires(&self, ids: &[FireId]) -> Result<Vec<EventFire>> {
        let rows = sqlx::query(LOAD_EVENT_FIRES)
            .bind(raw_ids(ids, |id| id.0))
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| -> Result<EventFire> {
                let fired_result: Option<String> = row.try_get("fired_result")?;
                Ok(EventFire {
                    fire_id: FireId(row.try_get("id")?),
                    event_id: CampaignEventId(row.try_get("event_id")?),
                    event_uuid: row.try_get("event_uuid")?,
                    campaign: CampaignRef {
                        uuid: row.try_get("campaign_uuid")?,
                        name: row.try_get("campaign_name")?,
                    },
                    flow_uuid: row.try_get("flow_uuid")?,
                    org_id: OrgId(row.try_get("org_id")?),
                    contact_id: ContactId(row.try_get("contact_id")?),
                    scheduled: row.try_get("scheduled")?,
                    fired: row.try_get("fired")?,
                    fired_result: fired_result.map(|code| code.parse::<FireResult>()).transpose()?,
                })
            })
            .collect()
    }

    async fn mark_events_fired(
        &self,
        fires: &[(FireId, FireResult)],
        fired_on: DateTime<Utc>,
    ) -> Result<()> {
        if fires.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = fires.iter().map(|(id, _)| id.0).collect();
        let results: Vec<String> = fires.iter().map(|(_, r)| r.code().to_string()).collect();

        sqlx::query(
            "UPDATE event_fires f
                SET fired = $3, fired_result = r.result
               FROM UNNEST($1::bigint[], $2::text[]) AS r(id, result)
              WHERE f.id = r.id AND f.fired IS NULL",
        )
        .bind(ids)
        .bind(results)
        .bind(fired_on)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_event_fires(&self, ids: &[FireId]) -> Result<()> {
        sqlx::query("DELETE FROM event_fires WHERE id = ANY($1) AND fired IS NULL")
            .bind(raw_ids(ids, |id| id.0))
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
