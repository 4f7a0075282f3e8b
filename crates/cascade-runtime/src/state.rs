use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cascade_core::trace::StepTrace;

/// Lifecycle status of a persistent workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// An engine invocation is in flight.
    Running,
    /// Paused between invocations.
    Suspended,
    /// Paused, waiting for a named signal.
    WaitingForSignal,
    /// Workflow completed successfully.
    Completed,
    /// Workflow failed.
    Failed,
    /// Workflow was cancelled.
    Cancelled,
    /// Workflow hit its deadline.
    TimedOut,
}

impl InstanceStatus {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::WaitingForSignal => "waiting_for_signal",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Check if the instance can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl FromStr for InstanceStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "suspended" => Self::Suspended,
            "waiting_for_signal" => Self::WaitingForSignal,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            _ => Self::Running,
        })
    }
}

/// Persistent embodiment of an in-flight workflow.
///
/// Status moves monotonically toward a terminal state, with one exception:
/// a waiting instance re-enters `Running` when its signal is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    /// Unique instance id.
    pub instance_id: Uuid,
    /// Workflow definition id.
    pub workflow_id: String,
    /// Human-readable workflow name.
    pub display_name: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// Last persisted write; the repository compare-and-sets on it.
    pub updated_at: DateTime<Utc>,
    /// Serialized context snapshot.
    pub context: serde_json::Value,
    /// Name of the most recently traced step.
    pub current_step: Option<String>,
    /// Signal the instance is waiting for.
    pub waiting_for_signal: Option<String>,
    /// Deadline for the awaited signal.
    pub signal_timeout_at: Option<DateTime<Utc>>,
    /// Step traces accumulated across invocations.
    pub history: Vec<StepTrace>,
    /// Signal payloads delivered so far, keyed by signal name. Steps
    /// consult these on replay to elide work already done.
    pub pending_changes: serde_json::Map<String, serde_json::Value>,
    /// Who started the instance.
    pub created_by: Option<String>,
}

impl InstanceState {
    /// Create a new running instance.
    pub fn new(
        workflow_id: impl Into<String>,
        display_name: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            display_name: display_name.into(),
            status: InstanceStatus::Running,
            created_at: now,
            updated_at: now,
            context,
            current_step: None,
            waiting_for_signal: None,
            signal_timeout_at: None,
            history: Vec::new(),
            pending_changes: serde_json::Map::new(),
            created_by: None,
        }
    }

    /// Mark as completed.
    pub fn complete(&mut self) {
        self.status = InstanceStatus::Completed;
        self.waiting_for_signal = None;
        self.signal_timeout_at = None;
    }

    /// Mark as failed.
    pub fn fail(&mut self) {
        self.status = InstanceStatus::Failed;
        self.waiting_for_signal = None;
        self.signal_timeout_at = None;
    }

    /// Mark as cancelled.
    pub fn cancel(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.waiting_for_signal = None;
        self.signal_timeout_at = None;
    }

    /// Mark as timed out.
    pub fn time_out(&mut self) {
        self.status = InstanceStatus::TimedOut;
        self.waiting_for_signal = None;
        self.signal_timeout_at = None;
    }

    /// Park the instance until the named signal arrives.
    pub fn wait_for_signal(&mut self, signal: impl Into<String>, timeout_at: DateTime<Utc>) {
        self.status = InstanceStatus::WaitingForSignal;
        self.waiting_for_signal = Some(signal.into());
        self.signal_timeout_at = Some(timeout_at);
    }

    /// Re-enter `Running` after signal delivery.
    pub fn resume(&mut self) {
        self.status = InstanceStatus::Running;
        self.waiting_for_signal = None;
        self.signal_timeout_at = None;
    }
}
