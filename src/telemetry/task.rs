//! Task execution span helpers.

use tracing::Span;

use crate::model::TaskEnvelope;

/// Start a span for one popped task.
///
/// `task.result` is declared empty and filled by [`record_result`].
pub fn start_task_span(queue: &str, task: &TaskEnvelope) -> Span {
    tracing::info_span!(
        "task.perform",
        "task.queue" = queue,
        "task.type" = %task.task_type,
        "task.org_id" = %task.org_id,
        "task.result" = tracing::field::Empty,
    )
}

pub fn record_result(span: &Span, result: &str) {
    span.record("task.result", result);
}
