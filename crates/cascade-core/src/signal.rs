use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::StepOutcome;

/// Sentinel prefix recognized on the failure channel.
///
/// A real [`StepOutcome::Suspend`] variant is the contract; the sentinel is
/// an interop encoding for step code ported from hosts without sum types.
/// The engine normalizes a failure message carrying this prefix into a
/// suspension before classifying the outcome.
pub const SIGNAL_SENTINEL_PREFIX: &str = "WAITING_FOR_SIGNAL:";

/// A requested cooperative pause, named by the signal that resumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspension {
    /// Name of the signal that resumes the workflow.
    pub signal: String,
    /// Optional deadline for the signal to arrive. When absent, the
    /// persistent driver applies its default signal timeout.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Step-supplied metadata carried onto the suspended result.
    pub metadata: Option<serde_json::Value>,
}

impl Suspension {
    /// Suspension with no deadline and no metadata.
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            timeout_at: None,
            metadata: None,
        }
    }

    /// Set an explicit signal deadline.
    pub fn with_deadline(mut self, timeout_at: DateTime<Utc>) -> Self {
        self.timeout_at = Some(timeout_at);
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Encode a signal name into the sentinel form.
pub fn encode_signal(signal: &str) -> String {
    format!("{}{}", SIGNAL_SENTINEL_PREFIX, signal)
}

/// Extract the signal name from a sentinel-encoded message.
///
/// The match is exact: the prefix must start the message, and the remainder
/// is the signal name verbatim.
pub fn extract_signal(message: &str) -> Option<&str> {
    message.strip_prefix(SIGNAL_SENTINEL_PREFIX)
}

/// Normalize a sentinel-encoded failure into a real suspension.
///
/// Metadata on the failure is preserved on the suspension. Every other
/// outcome passes through unchanged.
pub fn normalize(outcome: StepOutcome) -> StepOutcome {
    match outcome {
        StepOutcome::Failure {
            message,
            should_retry,
            metadata,
        } => match message.strip_prefix(SIGNAL_SENTINEL_PREFIX) {
            Some(signal) => StepOutcome::Suspend(Suspension {
                signal: signal.to_string(),
                timeout_at: None,
                metadata,
            }),
            None => StepOutcome::Failure {
                message,
                should_retry,
                metadata,
            },
        },
        other => other,
    }
}
