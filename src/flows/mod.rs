//! Interfaces to the flow engine and contact search.
//!
//! Nothing in this crate interprets flows. Starting contacts in a flow,
//! firing campaign events, resolving search queries and handling contact
//! events are all delegated to implementations of these traits, which own
//! their own transactions.

pub mod http;

pub use http::HttpFlowEngine;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::event::{ChannelEvent, MsgEvent, StopEvent, TicketClosedEvent, TimedEvent};
use crate::model::{CampaignRef, ContactId, EventFire, FlowStartBatch, OrgId};

#[async_trait]
pub trait FlowRunner: Send + Sync {
    /// Starts the batch's flow for `contact_ids`, which the caller has locked.
    /// Returns the contacts actually started.
    async fn start_flow_for_contacts(
        &self,
        batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>>;

    /// Requests outgoing calls for a voice flow batch. Returns the contacts a
    /// call was requested for.
    async fn request_calls(
        &self,
        batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>>;

    /// Fires one campaign event for every contact in `fires` and records each
    /// fire's result. Returns the contacts that were started; the caller marks
    /// their fires fired if the engine has not already done so.
    ///
    /// Returns [`crate::Error::FlowInactive`] when the campaign or its flow is
    /// no longer active.
    async fn fire_campaign_events(
        &self,
        org_id: OrgId,
        fires: &[EventFire],
        flow_uuid: Uuid,
        campaign: &CampaignRef,
        event_uuid: Uuid,
    ) -> Result<Vec<ContactId>>;
}

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Contacts matching a search query, at most `limit` of them if given.
    ///
    /// Returns [`crate::Error::Query`] when the query itself is invalid.
    async fn resolve_query(
        &self,
        org_id: OrgId,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContactId>>;
}

/// Domain handlers for each kind of contact event.
///
/// Called with the contact lock held.
#[async_trait]
pub trait ContactEventHandler: Send + Sync {
    async fn handle_msg(&self, org_id: OrgId, contact_id: ContactId, event: &MsgEvent)
    -> Result<()>;

    async fn handle_channel_event(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ChannelEvent,
    ) -> Result<()>;

    async fn handle_stop(&self, org_id: OrgId, contact_id: ContactId, event: &StopEvent)
    -> Result<()>;

    async fn handle_ticket_closed(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &TicketClosedEvent,
    ) -> Result<()>;

    async fn handle_timed(&self, org_id: OrgId, contact_id: ContactId, event: &TimedEvent)
    -> Result<()>;
}
