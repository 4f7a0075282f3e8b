use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::signal::Suspension;

/// Boxed future returned by step operations.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;

/// Outcome of a single step invocation.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step finished its work.
    Success { metadata: Option<serde_json::Value> },
    /// The step failed. `should_retry` marks the failure as transient;
    /// the retry policy still consults the step's own retryability flag.
    Failure {
        message: String,
        should_retry: bool,
        metadata: Option<serde_json::Value>,
    },
    /// The step requests a cooperative pause until the named signal arrives.
    Suspend(Suspension),
}

impl StepOutcome {
    /// Successful outcome with no metadata.
    pub fn success() -> Self {
        Self::Success { metadata: None }
    }

    /// Successful outcome carrying metadata.
    pub fn success_with(metadata: serde_json::Value) -> Self {
        Self::Success {
            metadata: Some(metadata),
        }
    }

    /// Terminal failure; attempts budget is not consulted.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            should_retry: false,
            metadata: None,
        }
    }

    /// Transient failure eligible for retry.
    pub fn retryable_failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            should_retry: true,
            metadata: None,
        }
    }

    /// Suspension on the named signal.
    pub fn suspend(signal: impl Into<String>) -> Self {
        Self::Suspend(Suspension::new(signal))
    }

    /// Check for success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Check for failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Check for suspension.
    pub fn is_suspend(&self) -> bool {
        matches!(self, Self::Suspend(_))
    }
}

/// Contract every workflow step implements.
///
/// Both operations receive the shared context and a cancellation token and
/// resolve to a [`StepOutcome`]. `compensate` is expected to be idempotent
/// and tolerant of running after a partial `execute` failure; the default
/// is a success no-op.
pub trait WorkflowStep<C>: Send + Sync {
    /// Stable identifier used in traces and compensation matching.
    fn name(&self) -> &str;

    /// Whether the retry policy may re-invoke this step after a transient failure.
    fn can_retry(&self) -> bool {
        true
    }

    /// Per-step wall-clock cap, independent of the workflow timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Perform the step's work.
    fn execute<'a>(&'a self, ctx: &'a C, cancel: &'a CancellationToken) -> StepFuture<'a>;

    /// Undo the step's observable effects.
    fn compensate<'a>(&'a self, _ctx: &'a C, _cancel: &'a CancellationToken) -> StepFuture<'a> {
        Box::pin(async { StepOutcome::success() })
    }
}

/// Render a panic payload as a failure message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        assert!(StepOutcome::success().is_success());
        assert!(StepOutcome::failure("boom").is_failure());
        assert!(StepOutcome::suspend("approval").is_suspend());
    }

    #[test]
    fn test_failure_retry_flag() {
        match StepOutcome::retryable_failure("io error") {
            StepOutcome::Failure { should_retry, .. } => assert!(should_retry),
            _ => panic!("Expected failure"),
        }
        match StepOutcome::failure("bad input") {
            StepOutcome::Failure { should_retry, .. } => assert!(!should_retry),
            _ => panic!("Expected failure"),
        }
    }

    #[test]
    fn test_panic_message_rendering() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(panic_message(payload), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload), "step panicked");
    }
}
