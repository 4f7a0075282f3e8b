use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate measurements for one workflow invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Total wall-clock time for the invocation.
    pub total_duration: Duration,
    /// Steps that ran to a terminal step status.
    pub steps_executed: u64,
    /// Steps that completed successfully.
    pub steps_succeeded: u64,
    /// Steps that failed terminally.
    pub steps_failed: u64,
    /// Retries consumed across all steps.
    pub total_retries: u64,
    /// Mean step duration across executed steps.
    pub average_step_duration: Duration,
    /// Traces evicted from the ring buffer.
    pub traces_dropped: u64,
}

/// Observability sink for workflow lifecycle counters.
///
/// Implementations publish counters and a per-workflow duration
/// observation, tagged with the workflow id, correlation id, and terminal
/// status.
pub trait ObservabilitySink: Send + Sync {
    /// An invocation entered the engine.
    fn workflow_started(&self, workflow_id: &str, correlation_id: Uuid);

    /// An invocation reached a terminal result.
    fn workflow_finished(
        &self,
        workflow_id: &str,
        correlation_id: Uuid,
        status: &str,
        duration: Duration,
    );
}

/// Sink that discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl ObservabilitySink for NoOpSink {
    fn workflow_started(&self, _workflow_id: &str, _correlation_id: Uuid) {}

    fn workflow_finished(
        &self,
        _workflow_id: &str,
        _correlation_id: Uuid,
        _status: &str,
        _duration: Duration,
    ) {
    }
}

/// Sink that publishes observations as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ObservabilitySink for LogSink {
    fn workflow_started(&self, workflow_id: &str, correlation_id: Uuid) {
        tracing::info!(
            workflow.id = %workflow_id,
            correlation.id = %correlation_id,
            "Workflow started"
        );
    }

    fn workflow_finished(
        &self,
        workflow_id: &str,
        correlation_id: Uuid,
        status: &str,
        duration: Duration,
    ) {
        tracing::info!(
            workflow.id = %workflow_id,
            correlation.id = %correlation_id,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Workflow finished"
        );
    }
}
