//! Control plane: worker loops that pop tasks from each queue and dispatch
//! them, plus the cron loops.
//!
//! A popped task is never redelivered by the queue. Task failures are logged
//! and counted here; any retrying is up to the task itself.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, warn};

use crate::cron::Crons;
use crate::error::{Error, Result};
use crate::queue::{BATCH_QUEUE, HANDLER_QUEUE};
use crate::runtime::Runtime;
use crate::tasks::{self, Registry};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_result, start_task_span};

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Concurrent workers popping from the batch queue.
    pub batch_workers: usize,
    /// Concurrent workers popping from the handler queue.
    pub handler_workers: usize,
    /// How long an idle worker sleeps before polling its queue again.
    pub poll_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            batch_workers: 4,
            handler_workers: 8,
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct ControlPlane {
    runtime: Runtime,
    registry: Arc<Registry>,
    crons: Arc<Crons>,
    config: ControlConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ControlPlane {
    pub fn new(runtime: Runtime, registry: Registry, crons: Crons, config: ControlConfig) -> Self {
        Self {
            runtime,
            registry: Arc::new(registry),
            crons: Arc::new(crons),
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Signal the control plane to shut down. Workers finish the task they
    /// are on first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run workers and crons until shutdown.
    pub async fn run(&self) -> Result<()> {
        for (queue, workers) in [
            (BATCH_QUEUE, self.config.batch_workers),
            (HANDLER_QUEUE, self.config.handler_workers),
        ] {
            for worker in 0..workers {
                let plane = self.clone();
                self.tracker
                    .spawn(async move { plane.work_queue(queue, worker).await });
            }
        }
        self.crons
            .start(&self.runtime, &self.tracker, &self.shutdown);

        info!(
            batch_workers = self.config.batch_workers,
            handler_workers = self.config.handler_workers,
            "control plane started"
        );

        self.shutdown.cancelled().await;
        info!("control plane shutting down");
        self.tracker.close();
        self.tracker.wait().await;
        info!("control plane stopped");
        Ok(())
    }

    async fn work_queue(&self, queue: &'static str, worker: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let idle = match self.process_next(queue).await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(queue, worker, error = %e, "unable to pop task");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// Pops and performs one task from `queue`. Returns false if the queue
    /// was empty. Only a failure to pop is returned as an error.
    pub async fn process_next(&self, queue: &str) -> Result<bool> {
        let Some(envelope) = self.runtime.queue.pop(queue).await? else {
            return Ok(false);
        };

        let span = start_task_span(queue, &envelope);
        let started = Instant::now();
        let result = tasks::perform(&self.runtime, &self.registry, &envelope)
            .instrument(span.clone())
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(Error::TaskTimeout { .. }) => "timeout",
            Err(Error::UnknownTaskType(_) | Error::Decode { .. }) => "unknown",
            Err(_) => "error",
        };
        record_result(&span, outcome);

        metrics::tasks_performed().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("task_type", envelope.task_type.clone()),
                KeyValue::new("result", outcome),
            ],
        );
        metrics::task_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new("task_type", envelope.task_type.clone())],
        );

        span.in_scope(|| match result {
            Ok(()) => info!(elapsed_ms = elapsed_ms as u64, "task complete"),
            Err(e @ (Error::UnknownTaskType(_) | Error::Decode { .. })) => {
                error!(error = %e, payload = %envelope.payload, "undecodable task discarded")
            }
            Err(e) if e.is_user_error() => warn!(error = %e, "task failed"),
            Err(e) => error!(error = %e, elapsed_ms = elapsed_ms as u64, "task failed"),
        });
        Ok(true)
    }
}
