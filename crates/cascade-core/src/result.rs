use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::WorkflowMetrics;
use crate::signal::Suspension;
use crate::trace::StepTrace;

/// A step whose compensation did not succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationFailure {
    /// Name of the step whose compensation failed.
    pub step_name: String,
    /// Why the compensation failed.
    pub reason: String,
}

/// Terminal classification of one invocation.
#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    /// The root completed.
    Success,
    /// A step failed terminally.
    Failure {
        error_message: String,
        compensation_failures: Vec<CompensationFailure>,
    },
    /// A step requested a cooperative pause.
    Suspended(Suspension),
    /// The caller's cancellation signal fired.
    Cancelled,
    /// The workflow deadline fired while the caller's signal stayed quiet.
    TimedOut,
}

impl WorkflowOutcome {
    /// Convert to string for storage and metrics tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Suspended(_) => "suspended",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Check for success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Check for suspension.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended(_))
    }
}

/// Terminal result of one engine invocation.
///
/// Exactly one result is produced per invocation, whatever path execution
/// took; the engine never surfaces workflow failures as errors. The context
/// is the same instance the caller passed in.
pub struct WorkflowResult<C> {
    /// The caller's context, unchanged reference.
    pub context: Arc<C>,
    /// Terminal classification.
    pub outcome: WorkflowOutcome,
    /// Aggregate measurements.
    pub metrics: WorkflowMetrics,
    /// Trace snapshot, present when execution tracing is enabled.
    pub traces: Option<Vec<StepTrace>>,
    /// Correlation id woven through traces and metrics.
    pub correlation_id: Uuid,
}

impl<C> WorkflowResult<C> {
    /// Check for success.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The signal name when the workflow suspended.
    pub fn suspended_signal(&self) -> Option<&str> {
        match &self.outcome {
            WorkflowOutcome::Suspended(s) => Some(&s.signal),
            _ => None,
        }
    }

    /// The failure message when the workflow failed.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            WorkflowOutcome::Failure { error_message, .. } => Some(error_message),
            _ => None,
        }
    }
}

impl<C> std::fmt::Debug for WorkflowResult<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowResult")
            .field("outcome", &self.outcome)
            .field("metrics", &self.metrics)
            .field("traces", &self.traces.as_ref().map(|t| t.len()))
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_strings() {
        assert_eq!(WorkflowOutcome::Success.as_str(), "success");
        assert_eq!(WorkflowOutcome::Cancelled.as_str(), "cancelled");
        assert_eq!(WorkflowOutcome::TimedOut.as_str(), "timed_out");
        assert_eq!(
            WorkflowOutcome::Suspended(Suspension::new("approval")).as_str(),
            "suspended"
        );
        assert_eq!(
            WorkflowOutcome::Failure {
                error_message: "boom".to_string(),
                compensation_failures: Vec::new(),
            }
            .as_str(),
            "failure"
        );
    }

    #[test]
    fn test_result_accessors() {
        let result = WorkflowResult {
            context: Arc::new(()),
            outcome: WorkflowOutcome::Suspended(Suspension::new("approval")),
            metrics: WorkflowMetrics::default(),
            traces: None,
            correlation_id: Uuid::new_v4(),
        };

        assert!(!result.is_success());
        assert_eq!(result.suspended_signal(), Some("approval"));
        assert_eq!(result.error_message(), None);
    }
}
