//! Shared fakes for integration tests: in-memory backends plus recording
//! stand-ins for the database and flow engine.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use taskroom::config::Limits;
use taskroom::contacts::MemoryContactEvents;
use taskroom::db::{FireStore, StartStore};
use taskroom::error::{Error, Result};
use taskroom::flows::{ContactEventHandler, FlowRunner, RecipientResolver};
use taskroom::lock::MemoryLocker;
use taskroom::marker::MemoryMarkers;
use taskroom::model::event::{ChannelEvent, MsgEvent, StopEvent, TicketClosedEvent, TimedEvent};
use taskroom::model::{
    CampaignEventId, CampaignRef, ContactId, DueFire, EventFire, FireId, FireResult, FlowId,
    FlowStartBatch, FlowType, GroupId, OrgId, StartId, StartStatus, TaskEnvelope,
};
use taskroom::queue::MemoryQueue;
use taskroom::tasks::{self, Registry};
use taskroom::Runtime;

pub const ORG: OrgId = OrgId(1);

/// Limits with short waits so contention tests finish quickly.
pub fn test_limits() -> Limits {
    Limits {
        contact_lock_wait: Duration::from_millis(50),
        contact_lock_ttl: Duration::from_secs(5),
        batch_lock_wait: Duration::from_millis(10),
        batch_lock_ceiling: Duration::from_millis(500),
        ..Limits::default()
    }
}

pub struct Harness {
    pub rt: Runtime,
    pub registry: Registry,
    pub queue: Arc<MemoryQueue>,
    pub markers: Arc<MemoryMarkers>,
    pub locker: Arc<MemoryLocker>,
    pub store: Arc<FakeStore>,
    pub runner: Arc<FakeRunner>,
    pub resolver: Arc<FakeResolver>,
    pub handlers: Arc<RecordingHandlers>,
}

pub fn harness() -> Harness {
    harness_with(test_limits())
}

pub fn harness_with(limits: Limits) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let markers = Arc::new(MemoryMarkers::new());
    let locker = Arc::new(MemoryLocker::new());
    let store = Arc::new(FakeStore::default());
    let runner = Arc::new(FakeRunner::new(store.clone()));
    let resolver = Arc::new(FakeResolver::default());
    let handlers = Arc::new(RecordingHandlers::default());

    let rt = Runtime {
        queue: queue.clone(),
        markers: markers.clone(),
        locker: locker.clone(),
        contact_events: Arc::new(MemoryContactEvents::new(limits.handler_flag_ttl)),
        fires: store.clone(),
        starts: store.clone(),
        runner: runner.clone(),
        resolver: resolver.clone(),
        handlers: handlers.clone(),
        limits,
    };

    Harness {
        rt,
        registry: Registry::with_core_tasks(),
        queue,
        markers,
        locker,
        store,
        runner,
        resolver,
        handlers,
    }
}

impl Harness {
    /// Pops every task currently on `queue`, in order, without running them.
    pub async fn pop_all(&self, queue: &str) -> Vec<TaskEnvelope> {
        let mut tasks = Vec::new();
        while let Some(task) = self.rt.queue.pop(queue).await.unwrap() {
            tasks.push(task);
        }
        tasks
    }

    /// Pops and performs tasks until `queue` is empty, including tasks the
    /// performed tasks queue. Returns each task's type and result.
    pub async fn run_queue(&self, queue: &str) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for _ in 0..1000 {
            let Some(task) = self.rt.queue.pop(queue).await.unwrap() else {
                return results;
            };
            let result = tasks::perform(&self.rt, &self.registry, &task).await;
            results.push((task.task_type.clone(), result));
        }
        panic!("queue {queue} never drained");
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StoreState {
    pub fires: BTreeMap<FireId, EventFire>,
    pub starts: HashMap<StartId, (StartStatus, Option<usize>)>,
    pub groups: HashMap<GroupId, Vec<ContactId>>,
    /// (flow, contact) for every flow run ever created.
    pub runs: Vec<(FlowId, ContactId)>,
    pub active_sessions: Vec<(FlowType, ContactId)>,
    pub created_contacts: Vec<ContactId>,
    pub fail_loads: bool,
}

#[derive(Default)]
pub struct FakeStore {
    pub state: Mutex<StoreState>,
}

impl FakeStore {
    /// Adds an unfired fire scheduled `minutes_ago` minutes before a fixed
    /// past instant, or that many minutes into the future when negative.
    pub fn add_fire(&self, fire_id: i64, event_id: i64, contact_id: i64, minutes_ago: i64) {
        let scheduled = if minutes_ago >= 0 {
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() - ChronoDuration::minutes(minutes_ago)
        } else {
            Utc::now() + ChronoDuration::minutes(-minutes_ago)
        };
        let event_uuid = Uuid::from_u128(event_id as u128);
        let fire = EventFire {
            fire_id: FireId(fire_id),
            event_id: CampaignEventId(event_id),
            event_uuid,
            campaign: CampaignRef {
                uuid: Uuid::from_u128(1000 + event_id as u128),
                name: format!("Campaign {event_id}"),
            },
            flow_uuid: flow_uuid(event_id),
            org_id: ORG,
            contact_id: ContactId(contact_id),
            scheduled,
            fired: None,
            fired_result: None,
        };
        self.state.lock().unwrap().fires.insert(FireId(fire_id), fire);
    }

    pub fn fire(&self, fire_id: i64) -> Option<EventFire> {
        self.state.lock().unwrap().fires.get(&FireId(fire_id)).cloned()
    }

    pub fn add_start(&self, id: StartId) {
        self.state
            .lock()
            .unwrap()
            .starts
            .insert(id, (StartStatus::Pending, None));
    }

    pub fn start_status(&self, id: StartId) -> (StartStatus, Option<usize>) {
        self.state.lock().unwrap().starts[&id]
    }

    pub fn add_group(&self, group: GroupId, contacts: impl IntoIterator<Item = i64>) {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert(group, contacts.into_iter().map(ContactId).collect());
    }

    pub fn runs_for(&self, flow_id: FlowId, contact_id: ContactId) -> usize {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .filter(|r| **r == (flow_id, contact_id))
            .count()
    }
}

/// The flow a campaign event starts, keyed by event.
pub fn flow_uuid(event_id: i64) -> Uuid {
    Uuid::from_u128(2000 + event_id as u128)
}

/// Stand-in for the numeric ID of a campaign event's flow.
pub fn campaign_flow_id(flow_uuid: Uuid) -> FlowId {
    FlowId(flow_uuid.as_u128() as i64)
}

fn minute(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(60)
}

#[async_trait]
impl FireStore for FakeStore {
    async fn select_due_fires(&self, limit: usize) -> Result<Vec<DueFire>> {
        let now = Utc::now();
        let state = self.state.lock().unwrap();
        let mut due: Vec<&EventFire> = state
            .fires
            .values()
            .filter(|f| f.fired.is_none() && f.scheduled <= now)
            .collect();
        due.sort_by_key(|f| (minute(f.scheduled), f.event_id, f.fire_id));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|f| DueFire {
                fire_id: f.fire_id,
                event_id: f.event_id,
                org_id: f.org_id,
                scheduled: f.scheduled,
            })
            .collect())
    }

    async fn load_event_fires(&self, ids: &[FireId]) -> Result<Vec<EventFire>> {
        let state = self.state.lock().unwrap();
        if state.fail_loads {
            return Err(Error::Other("connection refused".to_string()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.fires.get(id))
            .filter(|f| f.fired.is_none())
            .cloned()
            .collect())
    }

    async fn mark_events_fired(
        &self,
        fires: &[(FireId, FireResult)],
        fired_on: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (id, result) in fires {
            if let Some(fire) = state.fires.get_mut(id).filter(|f| f.fired.is_none()) {
                fire.fired = Some(fired_on);
                fire.fired_result = Some(*result);
            }
        }
        Ok(())
    }

    async fn delete_event_fires(&self, ids: &[FireId]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.fires.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl StartStore for FakeStore {
    async fn mark_start_started(&self, id: StartId, contact_count: usize) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .starts
            .insert(id, (StartStatus::Starting, Some(contact_count)));
        Ok(())
    }

    async fn mark_start_complete(&self, id: StartId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .starts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("flow start {id}")))?;
        match entry.0 {
            StartStatus::Complete => Ok(false),
            StartStatus::Starting => {
                entry.0 = StartStatus::Complete;
                Ok(true)
            }
            other => Err(Error::InvalidTransition {
                from: other.to_string(),
                to: StartStatus::Complete.to_string(),
            }),
        }
    }

    async fn mark_start_failed(&self, id: StartId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.starts.entry(id).or_insert((StartStatus::Pending, None));
        entry.0 = StartStatus::Failed;
        Ok(())
    }

    async fn group_contact_ids(
        &self,
        _org_id: OrgId,
        groups: &[GroupId],
    ) -> Result<Vec<ContactId>> {
        let state = self.state.lock().unwrap();
        let mut seen = HashSet::new();
        Ok(groups
            .iter()
            .filter_map(|g| state.groups.get(g))
            .flatten()
            .copied()
            .filter(|c| seen.insert(*c))
            .collect())
    }

    async fn create_contact(&self, _org_id: OrgId) -> Result<ContactId> {
        let mut state = self.state.lock().unwrap();
        let id = ContactId(10_000 + state.created_contacts.len() as i64);
        state.created_contacts.push(id);
        Ok(id)
    }

    async fn find_flow_started_overlap(
        &self,
        flow_id: FlowId,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let state = self.state.lock().unwrap();
        Ok(contacts
            .iter()
            .filter(|c| state.runs.contains(&(flow_id, **c)))
            .copied()
            .collect())
    }

    async fn find_active_session_overlap(
        &self,
        _org_id: OrgId,
        flow_type: FlowType,
        contacts: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        let state = self.state.lock().unwrap();
        Ok(contacts
            .iter()
            .filter(|c| state.active_sessions.contains(&(flow_type, **c)))
            .copied()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Flow engine
// ---------------------------------------------------------------------------

/// How the fake runner should respond.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunnerMode {
    #[default]
    Normal,
    /// Every call fails with a system error.
    Fail,
    /// Campaign fires report the flow inactive.
    Inactive,
}

#[derive(Default)]
pub struct RunnerState {
    pub mode: RunnerMode,
    /// Contacts the engine declines to start in a campaign event.
    pub skip: HashSet<ContactId>,
    /// Each call to start_flow_for_contacts, with the contacts passed.
    pub start_calls: Vec<Vec<ContactId>>,
    pub call_requests: Vec<Vec<ContactId>>,
    pub fire_calls: usize,
    /// Start campaign contacts without recording fire results.
    pub leave_unfired: bool,
    /// How long each start_flow_for_contacts call takes.
    pub start_delay: Duration,
}

pub struct FakeRunner {
    store: Arc<FakeStore>,
    pub state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn new(store: Arc<FakeStore>) -> Self {
        Self {
            store,
            state: Mutex::new(RunnerState::default()),
        }
    }

    pub fn set_mode(&self, mode: RunnerMode) {
        self.state.lock().unwrap().mode = mode;
    }

    fn fail(&self) -> Result<()> {
        match self.state.lock().unwrap().mode {
            RunnerMode::Fail => Err(Error::Other("engine unavailable".to_string())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FlowRunner for FakeRunner {
    async fn start_flow_for_contacts(
        &self,
        batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        self.state
            .lock()
            .unwrap()
            .start_calls
            .push(contact_ids.to_vec());
        self.fail()?;

        let delay = self.state.lock().unwrap().start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut store = self.store.state.lock().unwrap();
        for contact_id in contact_ids {
            store.runs.push((batch.flow_id, *contact_id));
        }
        Ok(contact_ids.to_vec())
    }

    async fn request_calls(
        &self,
        _batch: &FlowStartBatch,
        contact_ids: &[ContactId],
    ) -> Result<Vec<ContactId>> {
        self.state
            .lock()
            .unwrap()
            .call_requests
            .push(contact_ids.to_vec());
        self.fail()?;
        Ok(contact_ids.to_vec())
    }

    async fn fire_campaign_events(
        &self,
        _org_id: OrgId,
        fires: &[EventFire],
        flow_uuid: Uuid,
        _campaign: &CampaignRef,
        _event_uuid: Uuid,
    ) -> Result<Vec<ContactId>> {
        let skip = {
            let mut state = self.state.lock().unwrap();
            state.fire_calls += 1;
            match state.mode {
                RunnerMode::Fail => return Err(Error::Other("engine unavailable".to_string())),
                RunnerMode::Inactive => {
                    return Err(Error::FlowInactive("campaign archived".to_string()));
                }
                RunnerMode::Normal => state.skip.clone(),
            }
        };

        let mut results = Vec::new();
        let mut started = Vec::new();
        {
            let mut store = self.store.state.lock().unwrap();
            for fire in fires {
                if skip.contains(&fire.contact_id) {
                    results.push((fire.fire_id, FireResult::Skipped));
                } else {
                    store.runs.push((campaign_flow_id(flow_uuid), fire.contact_id));
                    results.push((fire.fire_id, FireResult::Fired));
                    started.push(fire.contact_id);
                }
            }
        }
        if !self.state.lock().unwrap().leave_unfired {
            self.store.mark_events_fired(&results, Utc::now()).await?;
        }
        Ok(started)
    }
}

#[derive(Default)]
pub struct FakeResolver {
    pub results: Mutex<HashMap<String, Vec<ContactId>>>,
    pub limits: Mutex<Vec<Option<usize>>>,
}

impl FakeResolver {
    pub fn set(&self, query: &str, contacts: impl IntoIterator<Item = i64>) {
        self.results
            .lock()
            .unwrap()
            .insert(query.to_string(), contacts.into_iter().map(ContactId).collect());
    }
}

#[async_trait]
impl RecipientResolver for FakeResolver {
    async fn resolve_query(
        &self,
        _org_id: OrgId,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContactId>> {
        self.limits.lock().unwrap().push(limit);
        let results = self.results.lock().unwrap();
        let contacts = results
            .get(query)
            .ok_or_else(|| Error::Query(format!("unable to parse query: {query}")))?;
        Ok(match limit {
            Some(n) => contacts.iter().take(n).copied().collect(),
            None => contacts.clone(),
        })
    }
}

/// Records every handled event as `(contact, description)`. Messages whose
/// text is "boom" always fail.
#[derive(Default)]
pub struct RecordingHandlers {
    pub handled: Mutex<Vec<(ContactId, String)>>,
    pub attempts: Mutex<HashMap<String, usize>>,
    /// How long each message takes to handle.
    pub msg_delay: Mutex<Duration>,
}

impl RecordingHandlers {
    pub fn handled_for(&self, contact_id: ContactId) -> Vec<String> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == contact_id)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn attempts(&self, description: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(description)
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, contact_id: ContactId, description: String) {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(description.clone())
            .or_default() += 1;
        self.handled.lock().unwrap().push((contact_id, description));
    }
}

#[async_trait]
impl ContactEventHandler for RecordingHandlers {
    async fn handle_msg(
        &self,
        _org_id: OrgId,
        contact_id: ContactId,
        event: &MsgEvent,
    ) -> Result<()> {
        let delay = *self.msg_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.record(contact_id, format!("msg:{}", event.text));
        if event.text == "boom" {
            return Err(Error::Other("deadlock detected".to_string()));
        }
        Ok(())
    }

    async fn handle_channel_event(
        &self,
        _org_id: OrgId,
        contact_id: ContactId,
        event: &ChannelEvent,
    ) -> Result<()> {
        self.record(contact_id, format!("channel:{}", event.event_type));
        Ok(())
    }

    async fn handle_stop(
        &self,
        _org_id: OrgId,
        contact_id: ContactId,
        _event: &StopEvent,
    ) -> Result<()> {
        self.record(contact_id, "stop".to_string());
        Ok(())
    }

    async fn handle_ticket_closed(
        &self,
        _org_id: OrgId,
        contact_id: ContactId,
        event: &TicketClosedEvent,
    ) -> Result<()> {
        self.record(contact_id, format!("ticket_closed:{}", event.ticket_id));
        Ok(())
    }

    async fn handle_timed(
        &self,
        _org_id: OrgId,
        contact_id: ContactId,
        event: &TimedEvent,
    ) -> Result<()> {
        self.record(contact_id, format!("timed:{:?}", event.kind));
        Ok(())
    }
}

pub fn msg(text: &str) -> taskroom::model::ContactEvent {
    taskroom::model::ContactEvent::Msg(MsgEvent {
        msg_id: 1,
        msg_uuid: Uuid::new_v4(),
        channel_id: 1,
        urn: "tel:+12065551212".to_string(),
        text: text.to_string(),
        attachments: Vec::new(),
    })
}
