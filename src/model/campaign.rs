//! Campaign event fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CampaignEventId, ContactId, FireId, OrgId};
use crate::error::Error;

/// Outcome recorded on a fire once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireResult {
    /// The contact was started in the event's flow.
    Fired,
    /// The contact was skipped (e.g. already in a flow and the event doesn't interrupt).
    Skipped,
}

impl FireResult {
    /// Single-character code stored in the `fired_result` column.
    pub fn code(self) -> &'static str {
        match self {
            FireResult::Fired => "F",
            FireResult::Skipped => "S",
        }
    }
}

impl std::str::FromStr for FireResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "F" => Ok(FireResult::Fired),
            "S" => Ok(FireResult::Skipped),
            other => Err(Error::Other(format!("unknown fire result code: {other}"))),
        }
    }
}

/// Reference to the campaign an event belongs to, passed to the flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRef {
    pub uuid: Uuid,
    pub name: String,
}

/// One (contact, campaign event) pairing due to execute.
///
/// A fire with `fired == None` is the durable signal of outstanding work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFire {
    pub fire_id: FireId,
    pub event_id: CampaignEventId,
    pub event_uuid: Uuid,
    pub campaign: CampaignRef,
    pub flow_uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub scheduled: DateTime<Utc>,
    pub fired: Option<DateTime<Utc>>,
    pub fired_result: Option<FireResult>,
}

/// The scanner's view of an unfired fire: just enough to dedupe and group it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueFire {
    pub fire_id: FireId,
    pub event_id: CampaignEventId,
    pub org_id: OrgId,
    pub scheduled: DateTime<Utc>,
}
