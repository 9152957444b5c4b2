//! Flow starts and the batches they are split into.

use serde::{Deserialize, Serialize};

use super::{ContactId, FlowId, GroupId, OrgId, StartId};
use crate::error::Error;

/// Which engine a flow runs in. Active-session exclusion is checked per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Messaging,
    Voice,
}

impl FlowType {
    pub fn code(self) -> &'static str {
        match self {
            FlowType::Messaging => "M",
            FlowType::Voice => "V",
        }
    }
}

/// How a start was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartType {
    Manual,
    Api,
    /// Started from a flow action targeting a single contact.
    FlowAction,
    Trigger,
}

/// Lifecycle of a flow start: pending -> starting -> complete | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Pending,
    Starting,
    Complete,
    Failed,
}

impl StartStatus {
    pub fn code(self) -> &'static str {
        match self {
            StartStatus::Pending => "P",
            StartStatus::Starting => "S",
            StartStatus::Complete => "C",
            StartStatus::Failed => "F",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StartStatus::Complete | StartStatus::Failed)
    }

    /// Whether a start in this status may move to `to`.
    pub fn can_transition_to(self, to: StartStatus) -> bool {
        use StartStatus::*;
        matches!(
            (self, to),
            (Pending, Starting) | (Pending, Failed) | (Starting, Complete) | (Starting, Failed)
        )
    }
}

impl std::str::FromStr for StartStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P" => Ok(StartStatus::Pending),
            "S" => Ok(StartStatus::Starting),
            "C" => Ok(StartStatus::Complete),
            "F" => Ok(StartStatus::Failed),
            other => Err(Error::Other(format!("unknown start status code: {other}"))),
        }
    }
}

impl std::fmt::Display for StartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StartStatus::Pending => "pending",
            StartStatus::Starting => "starting",
            StartStatus::Complete => "complete",
            StartStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A request to begin a flow for an audience of contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStart {
    pub id: StartId,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub flow_type: FlowType,
    pub start_type: StartType,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub exclude_group_ids: Vec<GroupId>,
    #[serde(default)]
    pub query: Option<String>,
    pub restart_participants: bool,
    pub include_active: bool,
    #[serde(default)]
    pub create_contact: bool,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_summary: Option<serde_json::Value>,
}

impl FlowStart {
    pub fn new(id: StartId, org_id: OrgId, flow_id: FlowId, flow_type: FlowType) -> Self {
        Self {
            id,
            org_id,
            flow_id,
            flow_type,
            start_type: StartType::Manual,
            contact_ids: Vec::new(),
            group_ids: Vec::new(),
            exclude_group_ids: Vec::new(),
            query: None,
            restart_participants: true,
            include_active: true,
            create_contact: false,
            extra: None,
            parent_summary: None,
        }
    }

    pub fn start_type(mut self, start_type: StartType) -> Self {
        self.start_type = start_type;
        self
    }

    pub fn contacts(mut self, ids: impl IntoIterator<Item = ContactId>) -> Self {
        self.contact_ids = ids.into_iter().collect();
        self
    }

    pub fn groups(mut self, ids: impl IntoIterator<Item = GroupId>) -> Self {
        self.group_ids = ids.into_iter().collect();
        self
    }

    pub fn exclude_groups(mut self, ids: impl IntoIterator<Item = GroupId>) -> Self {
        self.exclude_group_ids = ids.into_iter().collect();
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn restart_participants(mut self, restart: bool) -> Self {
        self.restart_participants = restart;
        self
    }

    pub fn include_active(mut self, include: bool) -> Self {
        self.include_active = include;
        self
    }

    pub fn create_contact(mut self, create: bool) -> Self {
        self.create_contact = create;
        self
    }

    /// Whether this start targets at most a couple of explicit contacts and
    /// nothing that needs resolving.
    pub fn is_small(&self, threshold: usize) -> bool {
        !self.create_contact
            && self.group_ids.is_empty()
            && self.query.is_none()
            && self.contact_ids.len() <= threshold
    }

    /// Creates one batch of this start for the given slice of contacts.
    pub fn create_batch(
        &self,
        contact_ids: Vec<ContactId>,
        is_last: bool,
        total_contacts: usize,
    ) -> FlowStartBatch {
        FlowStartBatch {
            start_id: self.id,
            org_id: self.org_id,
            flow_id: self.flow_id,
            flow_type: self.flow_type,
            start_type: self.start_type,
            contact_ids,
            restart_participants: self.restart_participants,
            include_active: self.include_active,
            extra: self.extra.clone(),
            parent_summary: self.parent_summary.clone(),
            is_last,
            total_contacts,
        }
    }
}

/// An immutable slice of a flow start, consumed by exactly one batch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStartBatch {
    pub start_id: StartId,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub flow_type: FlowType,
    pub start_type: StartType,
    pub contact_ids: Vec<ContactId>,
    pub restart_participants: bool,
    pub include_active: bool,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_summary: Option<serde_json::Value>,
    /// Only the final batch marks the start complete.
    pub is_last: bool,
    pub total_contacts: usize,
}
