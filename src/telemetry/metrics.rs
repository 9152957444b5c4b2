//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskroom")
}

/// Counter: tasks pushed onto a queue.
/// Labels: `queue`, `task_type`, `priority`.
pub fn tasks_queued() -> Counter<u64> {
    meter()
        .u64_counter("taskroom.tasks.queued")
        .with_description("Number of tasks queued")
        .build()
}

/// Counter: tasks popped and performed.
/// Labels: `queue`, `task_type`, `result` ("ok" | "error" | "timeout" | "unknown").
pub fn tasks_performed() -> Counter<u64> {
    meter()
        .u64_counter("taskroom.tasks.performed")
        .with_description("Number of tasks performed")
        .build()
}

/// Histogram: task duration in milliseconds.
/// Labels: `task_type`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskroom.task.duration_ms")
        .with_description("Task duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: campaign fires seen by the scanner.
/// Labels: `result` ("queued" | "duplicate").
pub fn campaign_fires() -> Counter<u64> {
    meter()
        .u64_counter("taskroom.campaigns.fires")
        .with_description("Campaign event fires scanned")
        .build()
}

/// Counter: contact events that failed handling.
/// Labels: `event`, `outcome` ("retried" | "dropped").
pub fn contact_event_failures() -> Counter<u64> {
    meter()
        .u64_counter("taskroom.contacts.event_failures")
        .with_description("Contact events that failed handling")
        .build()
}

/// Counter: contact lock acquisitions that timed out.
/// Labels: `context` ("handler" | "batch").
pub fn contact_lock_contention() -> Counter<u64> {
    meter()
        .u64_counter("taskroom.contacts.lock_contention")
        .with_description("Contact locks not acquired within the wait")
        .build()
}

/// Gauge: tasks waiting in a queue.
/// Labels: `queue`.
pub fn queue_size() -> Gauge<u64> {
    meter()
        .u64_gauge("taskroom.queue.size")
        .with_description("Tasks waiting in a queue")
        .build()
}
