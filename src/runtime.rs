//! The collaborators every task and cron is handed.
//!
//! Built once at process start and passed by reference into every
//! `perform`; nothing reaches into global state to find its queue, store or
//! flow engine.

use std::sync::Arc;

use deadpool_redis::Pool;
use secrecy::ExposeSecret;

use crate::config::{Config, Limits};
use crate::contacts::{ContactEventQueue, RedisContactEvents};
use crate::db::{Db, FireStore, StartStore};
use crate::error::{Error, Result};
use crate::flows::{ContactEventHandler, FlowRunner, HttpFlowEngine, RecipientResolver};
use crate::lock::{Locker, RedisLocker};
use crate::marker::{MarkerSet, RedisMarkers};
use crate::queue::{RedisQueue, TaskQueue};

#[derive(Clone)]
pub struct Runtime {
    pub queue: Arc<dyn TaskQueue>,
    pub markers: Arc<dyn MarkerSet>,
    pub locker: Arc<dyn Locker>,
    pub contact_events: Arc<dyn ContactEventQueue>,
    pub fires: Arc<dyn FireStore>,
    pub starts: Arc<dyn StartStore>,
    pub runner: Arc<dyn FlowRunner>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub handlers: Arc<dyn ContactEventHandler>,
    pub limits: Limits,
}

impl Runtime {
    /// Connects to Postgres, Redis and the flow engine named in `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
        let pool = redis_pool(config.redis_url.expose_secret())?;
        let engine = Arc::new(HttpFlowEngine::new(&config.engine_url)?);

        Ok(Self {
            queue: Arc::new(RedisQueue::new(pool.clone())),
            markers: Arc::new(RedisMarkers::new(pool.clone())),
            locker: Arc::new(RedisLocker::new(pool.clone())),
            contact_events: Arc::new(RedisContactEvents::new(
                pool,
                config.limits.handler_flag_ttl,
            )),
            fires: db.clone(),
            starts: db,
            runner: engine.clone(),
            resolver: engine.clone(),
            handlers: engine,
            limits: config.limits.clone(),
        })
    }
}

pub fn redis_pool(url: &str) -> Result<Pool> {
    deadpool_redis::Config::from_url(url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| Error::Config(format!("invalid redis configuration: {e}")))
}
