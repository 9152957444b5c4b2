//! Events queued for serialized, per-contact handling.
//!
//! Each variant is handled by a different domain handler; dispatch is an
//! exhaustive match so a new variant cannot be left unhandled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FlowId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactEvent {
    /// An incoming message.
    Msg(MsgEvent),
    /// A channel event such as a new conversation, referral or missed call.
    Channel(ChannelEvent),
    /// The contact opted out on a channel.
    Stop(StopEvent),
    /// A ticket for the contact was closed.
    TicketClosed(TicketClosedEvent),
    /// A session wait expired or timed out.
    Timed(TimedEvent),
}

impl ContactEvent {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ContactEvent::Msg(_) => "msg",
            ContactEvent::Channel(_) => "channel",
            ContactEvent::Stop(_) => "stop",
            ContactEvent::TicketClosed(_) => "ticket_closed",
            ContactEvent::Timed(_) => "timed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgEvent {
    pub msg_id: i64,
    pub msg_uuid: Uuid,
    pub channel_id: i64,
    pub urn: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub event_id: i64,
    pub event_type: String,
    pub channel_id: i64,
    pub urn: String,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    pub channel_id: i64,
    pub urn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketClosedEvent {
    pub ticket_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimedKind {
    Expiration,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub kind: TimedKind,
    pub session_uuid: Uuid,
    pub flow_id: FlowId,
    /// When the wait was due; stale events for a session that has since moved
    /// on are ignored by the handler.
    pub due_on: DateTime<Utc>,
}

/// A contact event as stored in the contact's queue, with its retry counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEventEnvelope {
    pub event: ContactEvent,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
}

impl ContactEventEnvelope {
    pub fn new(event: ContactEvent) -> Self {
        Self {
            event,
            queued_on: Utc::now(),
            error_count: 0,
        }
    }
}
