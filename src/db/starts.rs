//! Flow start status and audience queries.

use async_trait::async_trait;
use sqlx::Row;

use super::{Db, StartStore, raw_ids};
use crate::error::{Error, Result};
use crate::model::{ContactId, FlowId, FlowType, GroupId, OrgId, StartId, StartStatus};

/// Validate a status transition, returning an error if disallowed.
fn validate_transition(from: StartStatus, to: StartStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn contact_ids(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<ContactId>> {
    rows.iter()
        .map(|row| -> Result<ContactId> { Ok(ContactId(row.try_get("contact_id")?)) })
        .collect()
}

impl Db {
    async fn start_status(
        &self,
        tx: &mut sqlx::PgConnection,
        id: StartId,
    ) -> Result<StartStatus> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM flow_starts WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let (status,) = status.ok_or_else(|| Error::NotFound(format!("flow start {id}")))?;
        status.parse()
    }

    async fn transition_start(&self, id: StartId, to: StartStatus) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let from = self.start_status(&mut tx, id).await?;
        if from == to {
            tx.rollback().await?;
            return Ok(false);
        }
        validate_transition(from, to)?;

        sqlx::query("UPDATE flow_starts SET status = $2, modified_on = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(to.code())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl StartStore for Db {
    async fn mark_start_started(&self, id: StartId, contact_count: usize) -> Result<()> {
        sqlx::query(
            "UPDATE flow_starts SET status = 'S', contact_count = $2, modified_on = NOW()
              WHERE id = $1 AND status IN ('P', 'S')",
        )
        .bind(id.0)
        .bind(contact_count as i32)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn mark_start_complete(&self, id: StartId) -> Result<bool> {
        self.transition_start(id, StartStatus::Complete).await
    }

    async fn mark_start_failed(&self, id: StartId) -> Result<()> {
        self.transition_start(id, StartStatus::Failed).await?;
        Ok(())
    }

    async fn group_contact_ids(
        &self,
        org_id: OrgId,
        groups: &[GroupId],
    ) -> Result<Vec<ContactId>> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT DISTINCT gc.contact_id
               FROM group_contacts gc
               JOIN contacts c ON c.id = gc.contact_id
              WHERE gc.group_id = ANY($1) AND c.org_id = $2 AND c.is_active
              ORDER BY gc.contact_id",
        )
        .bind(raw_ids(groups, |id| id.0))
        .bind(org_id.0)
        .fetch_all(self.pool())
        .await?;
        contact_ids(&rows)
    }

    async fn create_contact(&self, org_id: OrgId) -> Result<ContactId> {
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO contacts (org_id) VALUES ($1) RETURNING id")
                .bind(org_id.0)
                .fetch_one(self.pool())
                .await?;
        Ok(ContactId(id))
    }

    async fn find_flow_started_overlap(
        &self,
        flow_id: FlowId,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT contact_id FROM flow_runs WHERE flow_id = $1 AND contact_id = ANY($2)",
        )
        .bind(flow_id.0)
        .bind(raw_ids(contacts, |id| id.0))
        .fetch_all(self.pool())
        .await?;
        contact_ids(&rows)
    }

    async fn find_active_session_overlap(
        &self,
        org_id: OrgId,
        flow_type: FlowType,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT contact_id FROM flow_sessions
              WHERE org_id = $1 AND session_type = $2 AND status = 'W' AND contact_id = ANY($3)",
        )
        .bind(org_id.0)
        .bind(flow_type.code())
        .bind(raw_ids(contacts, |id| id.0))
        .fetch_all(self.pool())
        .await?;
        contact_ids(&rows)
    }
}
