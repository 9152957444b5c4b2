//! JSON-over-HTTP client for an external flow engine.
//!
//! Every call is a POST of a JSON body. A 422 response means the request
//! carried a bad contact query and a 410 means the flow or campaign is no
//! longer active; both carry a plain-text reason in the body.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{ContactEventHandler, FlowRunner, RecipientResolver};
use crate::error::{Error, Result};
use crate::model::event::{ChannelEvent, MsgEvent, StopEvent, TicketClosedEvent, TimedEvent};
use crate::model::{CampaignRef, ContactId, EventFire, FlowStartBatch, OrgId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct HttpFlowEngine {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ContactsResponse {
    contact_ids: Vec<ContactId>,
}

#[derive(Deserialize)]
struct EmptyResponse {}

#[derive(Serialize)]
struct StartRequest<'a> {
    batch: &'a FlowStartBatch,
    contact_ids: &'a [ContactId],
}

#[derive(Serialize)]
struct FireRequest<'a> {
    org_id: OrgId,
    fires: &'a [EventFire],
    flow_uuid: Uuid,
    campaign: &'a CampaignRef,
    event_uuid: Uuid,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    org_id: OrgId,
    query: &'a str,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct EventRequest<'a, E: Serialize> {
    org_id: OrgId,
    contact_id: ContactId,
    event: &'a E,
}

impl HttpFlowEngine {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.client.post(&url).json(body).send().await?;

        match resp.status() {
            StatusCode::UNPROCESSABLE_ENTITY => {
                Err(Error::Query(resp.text().await.unwrap_or_default()))
            }
            StatusCode::GONE => Err(Error::FlowInactive(resp.text().await.unwrap_or_default())),
            status => {
                debug!(%url, %status, "flow engine responded");
                Ok(resp.error_for_status()?.json().await?)
            }
        }
    }

    async fn post_event<E: Serialize + Sync>(
        &self,
        path: &str,
        org_id: OrgId,
        contact_id: ContactId,
        event: &E,
    ) -> Result<()> {
        let _: EmptyResponse = self
            .post(
                path,
                &EventRequest {
                    org_id,
                    contact_id,
                    event,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowRunner for HttpFlowEngine {
    async fn start_flow_for_contacts(
        &self,
        batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let resp: ContactsResponse = self
            .post("/flow/start", &StartRequest { batch, contact_ids })
            .await?;
        Ok(resp.contact_ids)
    }

    async fn request_calls(
        &self,
        batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let resp: ContactsResponse = self
            .post("/ivr/request_calls", &StartRequest { batch, contact_ids })
            .await?;
        Ok(resp.contact_ids)
    }

    async fn fire_campaign_events(
        &self,
        org_id: OrgId,
        fires: &[EventFire],
        flow_uuid: Uuid,
        campaign: &CampaignRef,
        event_uuid: Uuid,
    ) -> Result<Vec<ContactId>> {
        let resp: ContactsResponse = self
            .post(
                "/campaign/fire",
                &FireRequest {
                    org_id,
                    fires,
                    flow_uuid,
                    campaign,
                    event_uuid,
                },
            )
            .await?;
        Ok(resp.contact_ids)
    }
}

#[async_trait]
impl RecipientResolver for HttpFlowEngine {
    async fn resolve_query(
        &self,
        org_id: OrgId,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContactId>> {
        let resp: ContactsResponse = self
            .post(
                "/contact/search",
                &SearchRequest {
                    org_id,
                    query,
                    limit,
                },
            )
            .await?;
        Ok(resp.contact_ids)
    }
}

#[async_trait]
impl ContactEventHandler for HttpFlowEngine {
    async fn handle_msg(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &MsgEvent,
    ) -> Result<()> {
        self.post_event("/contact/msg", org_id, contact_id, event).await
    }

    async fn handle_channel_event(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &ChannelEvent,
    ) -> Result<()> {
        self.post_event("/contact/channel_event", org_id, contact_id, event)
            .await
    }

    async fn handle_stop(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &StopEvent,
    ) -> Result<()> {
        self.post_event("/contact/stop", org_id, contact_id, event).await
    }

    async fn handle_ticket_closed(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &TicketClosedEvent,
    ) -> Result<()> {
        self.post_event("/contact/ticket_closed", org_id, contact_id, event)
            .await
    }

    async fn handle_timed(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        event: &TimedEvent,
    ) -> Result<()> {
        self.post_event("/contact/timed", org_id, contact_id, event)
            .await
    }
}
