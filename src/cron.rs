//! Periodic jobs.
//!
//! Crons run on a fixed interval in every process. Unless registered to run
//! on all instances, a run first takes the `cron:{name}` lock without waiting
//! so only one process does the work per interval. Every run is bounded by an
//! outer timeout independent of any task timeouts.

use opentelemetry::KeyValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::campaigns::{self, SCAN_CRON, SCAN_INTERVAL};
use crate::error::{Error, Result};
use crate::queue::{BATCH_QUEUE, HANDLER_QUEUE};
use crate::runtime::Runtime;
use crate::telemetry::metrics;

/// Upper bound on a single cron run, and the TTL of its lock.
pub const CRON_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const QUEUE_STATS_CRON: &str = "queue_stats";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type CronFn = Arc<dyn for<'a> Fn(&'a Runtime) -> BoxFuture<'a, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Cron {
    name: &'static str,
    interval: Duration,
    all_instances: bool,
    job: CronFn,
}

#[derive(Clone, Default)]
pub struct Crons {
    crons: Vec<Cron>,
}

impl Crons {
    pub fn new() -> Self {
        Self::default()
    }

    /// The campaign fire scan and queue statistics crons.
    pub fn with_core_crons() -> Self {
        let mut crons = Self::new();
        crons
            .register(SCAN_CRON, SCAN_INTERVAL, false, |rt| {
                Box::pin(async move { campaigns::queue_event_fires(rt).await.map(|_| ()) })
            })
            .register(QUEUE_STATS_CRON, Duration::from_secs(60), false, |rt| {
                Box::pin(record_queue_sizes(rt))
            });
        crons
    }

    pub fn register<F>(
        &mut self,
        name: &'static str,
        interval: Duration,
        all_instances: bool,
        job: F,
    ) -> &mut Self
    where
        F: for<'a> Fn(&'a Runtime) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.crons.push(Cron {
            name,
            interval,
            all_instances,
            job: Arc::new(job),
        });
        self
    }

    /// Runs the named cron once, as its schedule would. Returns false if the
    /// run was skipped because another instance holds its lock.
    pub async fn run_once(&self, rt: &Runtime, name: &str) -> Result<bool> {
        let cron = self
            .crons
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NotFound(format!("cron {name}")))?;
        run_cron(rt, cron).await
    }

    /// Spawns one loop per cron onto `tracker`, each ending when `shutdown`
    /// is cancelled.
    pub fn start(&self, rt: &Runtime, tracker: &TaskTracker, shutdown: &CancellationToken) {
        for cron in &self.crons {
            let cron = cron.clone();
            let rt = rt.clone();
            let shutdown = shutdown.clone();

            tracker.spawn(async move {
                info!(cron = cron.name, interval_secs = cron.interval.as_secs(), "cron started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(cron.interval) => {}
                    }
                    if let Err(e) = run_cron(&rt, &cron).await {
                        error!(cron = cron.name, error = %e, "cron failed");
                    }
                }
                info!(cron = cron.name, "cron stopped");
            });
        }
    }
}

async fn run_cron(rt: &Runtime, cron: &Cron) -> Result<bool> {
    let lock_key = format!("cron:{}", cron.name);
    let token = if cron.all_instances {
        None
    } else {
        match rt.locker.grab(&lock_key, CRON_TIMEOUT, Duration::ZERO).await? {
            Some(token) => Some(token),
            None => {
                debug!(cron = cron.name, "cron running elsewhere, skipping");
                return Ok(false);
            }
        }
    };

    let started = Instant::now();
    let result = match tokio::time::timeout(CRON_TIMEOUT, (cron.job)(rt)).await {
        Ok(result) => result,
        Err(_) => Err(Error::TaskTimeout {
            task_type: cron.name.to_string(),
            timeout: CRON_TIMEOUT,
        }),
    };

    if let Some(token) = token {
        if let Err(e) = rt.locker.release(&lock_key, &token).await {
            warn!(cron = cron.name, error = %e, "unable to release cron lock");
        }
    }

    result?;
    debug!(
        cron = cron.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "cron complete"
    );
    Ok(true)
}

async fn record_queue_sizes(rt: &Runtime) -> Result<()> {
    let batch = rt.queue.size(BATCH_QUEUE).await?;
    let handler = rt.queue.size(HANDLER_QUEUE).await?;

    metrics::queue_size().record(batch as u64, &[KeyValue::new("queue", BATCH_QUEUE)]);
    metrics::queue_size().record(handler as u64, &[KeyValue::new("queue", HANDLER_QUEUE)]);
    info!(batch, handler, "queue sizes");
    Ok(())
}
