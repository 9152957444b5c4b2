//! Postgres persistence: connection pool, migrations and the row-level
//! operations the campaign and start tasks need.
//!
//! Tasks reach the database only through [`FireStore`] and [`StartStore`] so
//! they can be exercised against in-memory fakes.

pub mod campaigns;
pub mod starts;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{
    ContactId, DueFire, EventFire, FireId, FireResult, FlowId, FlowType, GroupId, OrgId, StartId,
};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Campaign event fire rows.
#[async_trait]
pub trait FireStore: Send + Sync {
    /// Unfired fires that are due, ordered by scheduled minute then event,
    /// at most `limit` of them.
    async fn select_due_fires(&self, limit: usize) -> Result<Vec<DueFire>>;

    /// Loads the given fires that are still unfired. Fires already handled by
    /// an earlier delivery are simply absent.
    async fn load_event_fires(&self, ids: &[FireId]) -> Result<Vec<EventFire>>;

    /// Records a result for each fire that is still unfired. Fires that
    /// already have a result are left as they are.
    async fn mark_events_fired(
        &self,
        fires: &[(FireId, FireResult)],
        fired_on: DateTime<Utc>,
    ) -> Result<()>;

    async fn delete_event_fires(&self, ids: &[FireId]) -> Result<()>;
}

/// Flow start status and the audience lookups the batcher needs.
#[async_trait]
pub trait StartStore: Send + Sync {
    /// Moves a start to starting and records its resolved audience size.
    async fn mark_start_started(&self, id: StartId, contact_count: usize) -> Result<()>;

    /// Moves a starting start to complete. Returns false if it was already
    /// complete.
    async fn mark_start_complete(&self, id: StartId) -> Result<bool>;

    async fn mark_start_failed(&self, id: StartId) -> Result<()>;

    /// Members of any of the groups, each contact once.
    async fn group_contact_ids(&self, org_id: OrgId, groups: &[GroupId])
    -> Result<Vec<ContactId>>;

    async fn create_contact(&self, org_id: OrgId) -> Result<ContactId>;

    /// Which of `contacts` have ever had a run of `flow_id`.
    async fn find_flow_started_overlap(
        &self,
        flow_id: FlowId,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>>;

    /// Which of `contacts` have a waiting session of `flow_type`.
    async fn find_active_session_overlap(
        &self,
        org_id: OrgId,
        flow_type: FlowType,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>>;
}

pub(crate) fn raw_ids<T: Copy, F: Fn(T) -> i64>(ids: &[T], f: F) -> Vec<i64> {
    ids.iter().copied().map(f).collect()
}
