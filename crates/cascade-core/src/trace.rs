//! Per-step execution traces, kept in a fixed-memory ring buffer.
//!
//! The engine is the single writer. A snapshot is copied at terminal
//! transitions; an optional live stream publishes every append to a bounded
//! broadcast channel so a consumer can follow execution in real time
//! without ever blocking the engine.

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default ring buffer capacity.
pub const DEFAULT_TRACE_CAPACITY: usize = 10_000;

/// Terminal status of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTraceStatus {
    /// Step finished successfully.
    Completed,
    /// Step failed after exhausting its retry budget.
    Failed,
    /// Cancellation fired while the step was in flight.
    Cancelled,
    /// Step requested suspension.
    Suspended,
}

impl StepTraceStatus {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for StepTraceStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "suspended" => Self::Suspended,
            _ => Self::Completed,
        })
    }
}

/// Record of one step execution, spanning all retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    /// Step name as reported by the step itself.
    pub step_name: String,
    /// Type id the step was resolved under; compensation resolves with it.
    pub step_type_id: String,
    /// Context type the step ran against; compensation validates it.
    pub context_type_id: String,
    /// When the first attempt started.
    pub started_at: DateTime<Utc>,
    /// When the final attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration across all attempts.
    pub duration_ms: u64,
    /// Terminal status of the step.
    pub status: StepTraceStatus,
    /// Retries consumed (0 means the first attempt settled it).
    pub retry_attempts: u32,
    /// Correlation id of the invocation.
    pub correlation_id: Uuid,
    /// Failure message, when status is not completed.
    pub error_message: Option<String>,
    /// Step-supplied metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Fixed-capacity ring of step traces with an optional live stream sink.
pub struct TraceBuffer {
    entries: VecDeque<StepTrace>,
    capacity: usize,
    dropped: u64,
    overflow_logged: bool,
    stream: Option<broadcast::Sender<StepTrace>>,
}

impl TraceBuffer {
    /// Create a buffer with the given capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
            overflow_logged: false,
            stream: None,
        }
    }

    /// Create a buffer whose appends are also published to a live stream.
    ///
    /// The channel capacity equals the buffer capacity; a lagging consumer
    /// loses the oldest entries, mirroring the ring policy. The stream ends
    /// when the buffer is dropped at the workflow's terminal transition.
    pub fn with_stream(capacity: usize) -> (Self, TraceStream) {
        let mut buffer = Self::new(capacity);
        let (tx, rx) = broadcast::channel(buffer.capacity);
        buffer.stream = Some(tx);
        (buffer, TraceStream { rx, lagged: 0 })
    }

    /// Append a trace, evicting the oldest entry when full.
    pub fn push(&mut self, trace: StepTrace) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
            if !self.overflow_logged {
                self.overflow_logged = true;
                tracing::warn!(
                    capacity = self.capacity,
                    "Trace buffer full, overwriting oldest entries"
                );
            }
        }
        if let Some(tx) = &self.stream {
            // Send fails only when no receiver is alive; the engine never
            // blocks on consumers either way.
            let _ = tx.send(trace.clone());
        }
        self.entries.push_back(trace);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<StepTrace> {
        self.entries.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Live consumer side of the trace stream.
///
/// Finite and not restartable: `recv` yields traces in append order and
/// returns `None` once the workflow reaches a terminal state.
pub struct TraceStream {
    rx: broadcast::Receiver<StepTrace>,
    lagged: u64,
}

impl TraceStream {
    /// Receive the next trace, or `None` when the stream has ended.
    ///
    /// A consumer that falls behind skips to the oldest retained entry;
    /// skipped entries are counted, not delivered.
    pub async fn recv(&mut self) -> Option<StepTrace> {
        loop {
            match self.rx.recv().await {
                Ok(trace) => return Some(trace),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Entries this consumer missed by lagging.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(name: &str) -> StepTrace {
        let now = Utc::now();
        StepTrace {
            step_name: name.to_string(),
            step_type_id: name.to_string(),
            context_type_id: "test".to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            status: StepTraceStatus::Completed,
            retry_attempts: 0,
            correlation_id: Uuid::new_v4(),
            error_message: None,
            metadata: None,
        }
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut buffer = TraceBuffer::new(3);
        for name in ["a", "b", "c", "d", "e"] {
            buffer.push(trace(name));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);

        let names: Vec<String> = buffer
            .snapshot()
            .into_iter()
            .map(|t| t.step_name)
            .collect();
        assert_eq!(names, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_dropped_counts_every_eviction() {
        let mut buffer = TraceBuffer::new(1);
        buffer.push(trace("a"));
        assert_eq!(buffer.dropped(), 0);

        buffer.push(trace("b"));
        buffer.push(trace("c"));
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(StepTraceStatus::Completed.as_str(), "completed");
        assert_eq!(StepTraceStatus::Suspended.as_str(), "suspended");
        assert_eq!(
            "failed".parse::<StepTraceStatus>(),
            Ok(StepTraceStatus::Failed)
        );
        assert_eq!(
            "cancelled".parse::<StepTraceStatus>(),
            Ok(StepTraceStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_stream_receives_appends_and_closes() {
        let (mut buffer, mut stream) = TraceBuffer::with_stream(8);
        buffer.push(trace("a"));
        buffer.push(trace("b"));

        assert_eq!(stream.recv().await.unwrap().step_name, "a");
        assert_eq!(stream.recv().await.unwrap().step_name, "b");

        drop(buffer);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_lag_skips_to_oldest_retained() {
        let (mut buffer, mut stream) = TraceBuffer::with_stream(2);
        for name in ["a", "b", "c", "d"] {
            buffer.push(trace(name));
        }
        drop(buffer);

        // The channel retains the newest two entries; the rest are counted
        // as lag.
        assert_eq!(stream.recv().await.unwrap().step_name, "c");
        assert_eq!(stream.recv().await.unwrap().step_name, "d");
        assert!(stream.recv().await.is_none());
        assert_eq!(stream.lagged(), 2);
    }
}
