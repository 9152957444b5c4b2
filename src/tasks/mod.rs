//! Task registry and dispatch.
//!
//! A queue only stores [`TaskEnvelope`]s: a type name, an org and an opaque
//! JSON payload. The [`Registry`] maps type names to decoders, and
//! [`perform`] turns a popped envelope back into a concrete [`Task`] and runs
//! it under the task's own timeout.
//!
//! The registry is built explicitly by the process entry point before any
//! worker starts and is read-only afterwards.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::campaigns::FireCampaignEventTask;
use crate::contacts::HandleContactEventTask;
use crate::error::{Error, Result};
use crate::model::{OrgId, Priority, TaskEnvelope};
use crate::queue;
use crate::runtime::Runtime;
use crate::starts::{StartFlowBatchTask, StartFlowTask, StartIVRFlowBatchTask};

#[async_trait]
pub trait Task: Send + Sync {
    /// Name this task is registered and queued under.
    fn task_type(&self) -> &'static str;

    /// How long `perform` may run before it is cancelled.
    fn timeout(&self) -> Duration;

    async fn perform(&self, rt: &Runtime, org_id: OrgId) -> Result<()>;
}

type Decoder = fn(serde_json::Value) -> serde_json::Result<Box<dyn Task>>;

fn decode<T: Task + DeserializeOwned + 'static>(
    payload: serde_json::Value,
) -> serde_json::Result<Box<dyn Task>> {
    Ok(Box::new(serde_json::from_value::<T>(payload)?))
}

#[derive(Default)]
pub struct Registry {
    decoders: HashMap<&'static str, Decoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every task type this crate defines.
    pub fn with_core_tasks() -> Self {
        let mut registry = Self::new();
        registry
            .register::<FireCampaignEventTask>(FireCampaignEventTask::TYPE)
            .register::<StartFlowTask>(StartFlowTask::TYPE)
            .register::<StartFlowBatchTask>(StartFlowBatchTask::TYPE)
            .register::<StartIVRFlowBatchTask>(StartIVRFlowBatchTask::TYPE)
            .register::<HandleContactEventTask>(HandleContactEventTask::TYPE);
        registry
    }

    /// Registers `T` under `name`. Registering a name twice replaces the
    /// earlier decoder.
    pub fn register<T>(&mut self, name: &'static str) -> &mut Self
    where
        T: Task + DeserializeOwned + 'static,
    {
        if self.decoders.insert(name, decode::<T>).is_some() {
            warn!(task_type = name, "task type registered twice, replacing");
        }
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.decoders.contains_key(task_type)
    }

    pub fn task_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decodes a payload into the task registered for `task_type`.
    pub fn read_task(&self, task_type: &str, payload: serde_json::Value) -> Result<Box<dyn Task>> {
        let decoder = self
            .decoders
            .get(task_type)
            .ok_or_else(|| Error::UnknownTaskType(task_type.to_string()))?;

        decoder(payload).map_err(|source| Error::Decode {
            task_type: task_type.to_string(),
            source,
        })
    }
}

/// Decodes and runs one popped task under its declared timeout.
pub async fn perform(rt: &Runtime, registry: &Registry, envelope: &TaskEnvelope) -> Result<()> {
    let task = registry.read_task(&envelope.task_type, envelope.payload.clone())?;
    let timeout = task.timeout();

    match tokio::time::timeout(timeout, task.perform(rt, envelope.org_id)).await {
        Ok(result) => result,
        Err(_) => Err(Error::TaskTimeout {
            task_type: envelope.task_type.clone(),
            timeout,
        }),
    }
}

/// Serializes `task` and pushes it onto `queue` for `org_id`.
pub async fn queue_task<T: Task + Serialize>(
    rt: &Runtime,
    queue: &str,
    org_id: OrgId,
    task: &T,
    priority: Priority,
) -> Result<()> {
    let payload = serde_json::to_value(task)?;
    queue::add_task(
        rt.queue.as_ref(),
        queue,
        task.task_type(),
        org_id,
        payload,
        priority,
    )
    .await
}
