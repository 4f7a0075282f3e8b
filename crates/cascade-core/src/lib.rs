pub mod compensator;
pub mod definition;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod node;
pub mod resolver;
pub mod result;
pub mod retry;
pub mod signal;
pub mod step;
pub mod trace;

pub use compensator::Compensator;
pub use definition::WorkflowDefinition;
pub use engine::{Engine, ExecutionOptions};
pub use error::{CascadeError, Result};
pub use metrics::{LogSink, NoOpSink, ObservabilitySink, WorkflowMetrics};
pub use node::{Node, NodeId, Predicate};
pub use resolver::{StepRegistry, StepResolver};
pub use result::{CompensationFailure, WorkflowOutcome, WorkflowResult};
pub use retry::RetryPolicy;
pub use signal::{
    encode_signal, extract_signal, Suspension, SIGNAL_SENTINEL_PREFIX,
};
pub use step::{StepFuture, StepOutcome, WorkflowStep};
pub use trace::{
    StepTrace, StepTraceStatus, TraceBuffer, TraceStream, DEFAULT_TRACE_CAPACITY,
};
