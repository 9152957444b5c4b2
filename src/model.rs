//! Core data model.
//!
//! Typed identifiers, the generic task envelope every queue carries, and the
//! payload types for campaign fires, flow starts and contact events.

pub mod campaign;
pub mod event;
pub mod start;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use campaign::{CampaignRef, DueFire, EventFire, FireResult};
pub use event::{ContactEvent, ContactEventEnvelope};
pub use start::{FlowStart, FlowStartBatch, FlowType, StartStatus, StartType};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// A tenant. Queues and locks are partitioned by org.
    OrgId
);
id_type!(ContactId);
id_type!(FlowId);
id_type!(GroupId);
id_type!(StartId);
id_type!(CampaignEventId);
id_type!(
    /// One scheduled (contact, campaign event) pairing.
    FireId
);

// ---------------------------------------------------------------------------
// Task Envelope
// ---------------------------------------------------------------------------

/// Queue priority. Within an org, high priority tasks are popped before bulk ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Bulk,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Bulk => "bulk",
            Priority::High => "high",
        };
        write!(f, "{s}")
    }
}

/// What a queue actually stores: the task type used for dispatch, the owning
/// org and an opaque payload the registry decodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: String,
    pub org_id: OrgId,
    pub payload: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
}

impl TaskEnvelope {
    pub fn new(task_type: impl Into<String>, org_id: OrgId, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            org_id,
            payload,
            queued_on: Utc::now(),
            error_count: 0,
        }
    }
}
