//! The workflow engine.
//!
//! Walks a compiled node graph over a shared context, classifying each step
//! outcome, applying the retry policy, enforcing per-step and workflow
//! timeouts, and recording a trace per step. Every invocation produces
//! exactly one terminal [`WorkflowResult`]; failures inside steps never
//! escape as errors or panics.

use std::any::type_name;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::compensator::Compensator;
use crate::definition::WorkflowDefinition;
use crate::metrics::{NoOpSink, ObservabilitySink, WorkflowMetrics};
use crate::node::{Node, NodeId};
use crate::resolver::StepResolver;
use crate::result::{WorkflowOutcome, WorkflowResult};
use crate::retry::RetryPolicy;
use crate::signal::{self, Suspension};
use crate::step::{panic_message, StepOutcome};
use crate::trace::{
    StepTrace, StepTraceStatus, TraceBuffer, TraceStream, DEFAULT_TRACE_CAPACITY,
};

/// Per-invocation execution options.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Correlation id propagated to every trace and the result.
    /// Freshly generated when absent.
    pub correlation_id: Option<Uuid>,
    /// Caps total wall-clock; overrides the definition's timeout when set.
    pub workflow_timeout: Option<Duration>,
    /// Emit structured spans around step execution.
    pub enable_tracing: bool,
    /// Include the trace snapshot in the result.
    pub enable_execution_tracing: bool,
    /// Run compensation on terminal failure.
    pub enable_compensation: bool,
    /// Global retry cap consulted by the retry policy.
    pub max_retry_attempts: u32,
    /// Backoff base delay.
    pub retry_base_delay: Duration,
    /// Backoff delay cap.
    pub max_retry_delay: Duration,
    /// Trace ring buffer capacity.
    pub trace_capacity: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            correlation_id: None,
            workflow_timeout: None,
            enable_tracing: true,
            enable_execution_tracing: true,
            enable_compensation: false,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(30),
            trace_capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

/// Internal classification of one node's evaluation.
enum NodeOutcome {
    Success,
    Failure { message: String },
    Suspended(Suspension),
    Cancelled,
}

#[derive(Default)]
struct StepCounters {
    executed: u64,
    succeeded: u64,
    failed: u64,
    retries: u64,
    step_duration_total: Duration,
}

/// Mutable per-invocation state. The engine holds none of this across
/// invocations.
struct ExecState {
    workflow_id: String,
    correlation_id: Uuid,
    context_type_id: &'static str,
    retry: RetryPolicy,
    enable_tracing: bool,
    enable_compensation: bool,
    buffer: Mutex<TraceBuffer>,
    visited: Mutex<HashSet<NodeId>>,
    counters: Mutex<StepCounters>,
}

impl ExecState {
    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        step_name: &str,
        step_type_id: &str,
        started_at: DateTime<Utc>,
        started: Instant,
        status: StepTraceStatus,
        retry_attempts: u32,
        error_message: Option<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let elapsed = started.elapsed();
        let trace = StepTrace {
            step_name: step_name.to_string(),
            step_type_id: step_type_id.to_string(),
            context_type_id: self.context_type_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            status,
            retry_attempts,
            correlation_id: self.correlation_id,
            error_message,
            metadata,
        };
        self.buffer.lock().unwrap().push(trace);

        let mut counters = self.counters.lock().unwrap();
        counters.executed += 1;
        counters.step_duration_total += elapsed;
        match status {
            StepTraceStatus::Completed => counters.succeeded += 1,
            StepTraceStatus::Failed => counters.failed += 1,
            StepTraceStatus::Cancelled | StepTraceStatus::Suspended => {}
        }
    }
}

/// Executes compiled workflow definitions.
///
/// The engine is stateless across invocations; it owns only the step
/// resolver and the observability sink, both shared.
pub struct Engine<C> {
    resolver: Arc<dyn StepResolver<C>>,
    sink: Arc<dyn ObservabilitySink>,
}

impl<C> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Engine<C> {
    /// Create an engine over a step resolver.
    pub fn new(resolver: Arc<dyn StepResolver<C>>) -> Self {
        Self {
            resolver,
            sink: Arc::new(NoOpSink),
        }
    }

    /// Attach an observability sink.
    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Execute a workflow to its terminal result.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition<C>,
        context: Arc<C>,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> WorkflowResult<C> {
        let buffer = TraceBuffer::new(options.trace_capacity);
        self.run(definition, context, options, cancel, buffer).await
    }

    /// Execute a workflow while streaming traces live.
    ///
    /// The stream must be consumed concurrently with the returned future;
    /// it ends when the workflow reaches its terminal state.
    pub fn execute_with_streaming<'a>(
        &'a self,
        definition: &'a WorkflowDefinition<C>,
        context: Arc<C>,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> (
        TraceStream,
        impl Future<Output = WorkflowResult<C>> + Send + 'a,
    ) {
        let (buffer, stream) = TraceBuffer::with_stream(options.trace_capacity);
        (stream, self.run(definition, context, options, cancel, buffer))
    }

    async fn run(
        &self,
        definition: &WorkflowDefinition<C>,
        context: Arc<C>,
        options: ExecutionOptions,
        caller: CancellationToken,
        buffer: TraceBuffer,
    ) -> WorkflowResult<C> {
        let started = Instant::now();
        let correlation_id = options.correlation_id.unwrap_or_else(Uuid::new_v4);
        self.sink
            .workflow_started(&definition.workflow_id, correlation_id);

        let effective_timeout = options.workflow_timeout.or(definition.timeout);
        let state = ExecState {
            workflow_id: definition.workflow_id.clone(),
            correlation_id,
            context_type_id: type_name::<C>(),
            retry: RetryPolicy {
                max_attempts: options.max_retry_attempts,
                base_delay: options.retry_base_delay,
                max_delay: options.max_retry_delay,
            },
            enable_tracing: options.enable_tracing,
            enable_compensation: options.enable_compensation,
            buffer: Mutex::new(buffer),
            visited: Mutex::new(HashSet::new()),
            counters: Mutex::new(StepCounters::default()),
        };

        // The workflow deadline cancels a child of the caller's token, so a
        // fired deadline is distinguishable from a caller cancellation.
        let work = caller.child_token();
        let timer = effective_timeout.map(|timeout| {
            let token = work.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        });

        let walked = match std::panic::catch_unwind(AssertUnwindSafe(|| definition.root())) {
            Ok(root) => self.walk(root, context.as_ref(), &state, &work).await,
            Err(payload) => NodeOutcome::Failure {
                message: format!(
                    "Workflow definition failed to build: {}",
                    panic_message(payload)
                ),
            },
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        let outcome = match walked {
            NodeOutcome::Success => WorkflowOutcome::Success,
            NodeOutcome::Suspended(suspension) => {
                tracing::info!(
                    workflow.id = %state.workflow_id,
                    correlation.id = %correlation_id,
                    signal = %suspension.signal,
                    "Workflow suspended"
                );
                WorkflowOutcome::Suspended(suspension)
            }
            NodeOutcome::Failure { message } => {
                let snapshot = state.buffer.lock().unwrap().snapshot();
                let compensation_failures =
                    if state.enable_compensation && !snapshot.is_empty() {
                        tracing::info!(
                            workflow.id = %state.workflow_id,
                            correlation.id = %correlation_id,
                            "Workflow failed, running compensation"
                        );
                        Compensator::new(self.resolver.as_ref())
                            .run(&snapshot, context.as_ref(), &work)
                            .await
                    } else {
                        Vec::new()
                    };
                WorkflowOutcome::Failure {
                    error_message: message,
                    compensation_failures,
                }
            }
            NodeOutcome::Cancelled => {
                if caller.is_cancelled() {
                    WorkflowOutcome::Cancelled
                } else {
                    WorkflowOutcome::TimedOut
                }
            }
        };

        let total_duration = started.elapsed();
        let ExecState {
            buffer, counters, ..
        } = state;
        let buffer = buffer.into_inner().unwrap();
        let counters = counters.into_inner().unwrap();

        let metrics = WorkflowMetrics {
            total_duration,
            steps_executed: counters.executed,
            steps_succeeded: counters.succeeded,
            steps_failed: counters.failed,
            total_retries: counters.retries,
            average_step_duration: if counters.executed > 0 {
                counters.step_duration_total / counters.executed as u32
            } else {
                Duration::ZERO
            },
            traces_dropped: buffer.dropped(),
        };

        let traces = options.enable_execution_tracing.then(|| buffer.snapshot());
        // Dropping the buffer ends the live trace stream.
        drop(buffer);

        self.sink.workflow_finished(
            &definition.workflow_id,
            correlation_id,
            outcome.as_str(),
            total_duration,
        );

        WorkflowResult {
            context,
            outcome,
            metrics,
            traces,
            correlation_id,
        }
    }

    fn walk<'a>(
        &'a self,
        node: &'a Node<C>,
        ctx: &'a C,
        state: &'a ExecState,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, NodeOutcome> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return NodeOutcome::Cancelled;
            }
            if !state.visited.lock().unwrap().insert(node.id()) {
                tracing::warn!(
                    node = %node.id(),
                    kind = node.kind(),
                    "Node already executed in this invocation, skipping revisit"
                );
                return NodeOutcome::Success;
            }

            match node {
                Node::Step { step_type_id, .. } => {
                    self.run_step(step_type_id, ctx, state, cancel).await
                }
                Node::Sequence { children, .. } => {
                    for child in children {
                        match self.walk(child, ctx, state, cancel).await {
                            NodeOutcome::Success => continue,
                            other => return other,
                        }
                    }
                    NodeOutcome::Success
                }
                Node::Parallel {
                    children,
                    max_concurrency,
                    ..
                } => {
                    self.run_parallel(children, *max_concurrency, ctx, state, cancel)
                        .await
                }
                Node::Conditional {
                    predicate,
                    then_branch,
                    else_branch,
                    ..
                } => {
                    let branch = if (predicate.as_ref())(ctx) {
                        Some(then_branch.as_ref())
                    } else {
                        else_branch.as_deref()
                    };
                    match branch {
                        Some(next) => self.walk(next, ctx, state, cancel).await,
                        None => NodeOutcome::Success,
                    }
                }
                Node::Delay { duration, next, .. } => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => self.walk(next, ctx, state, cancel).await,
                        _ = cancel.cancelled() => NodeOutcome::Cancelled,
                    }
                }
            }
        })
    }

    async fn run_parallel(
        &self,
        children: &[Node<C>],
        max_concurrency: Option<usize>,
        ctx: &C,
        state: &ExecState,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        if children.is_empty() {
            return NodeOutcome::Success;
        }

        // Children run under a scope token so the first non-success can
        // cancel its unfinished siblings without touching the caller's
        // token.
        let scope = cancel.child_token();
        let scope_ref = &scope;
        let limit = max_concurrency.unwrap_or(children.len()).max(1);
        let futs: Vec<_> = children
            .iter()
            .map(|child| self.walk(child, ctx, state, scope_ref))
            .collect();
        let mut outcomes = futures::stream::iter(futs).buffer_unordered(limit);

        let mut first_failure: Option<String> = None;
        let mut first_suspend: Option<Suspension> = None;
        let mut saw_cancelled = false;

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                NodeOutcome::Success => {}
                NodeOutcome::Failure { message } => {
                    if first_failure.is_none() {
                        first_failure = Some(message);
                        scope.cancel();
                    } else {
                        tracing::debug!(
                            error = %message,
                            "Additional parallel branch failure after the first"
                        );
                    }
                }
                NodeOutcome::Suspended(suspension) => {
                    if first_suspend.is_none() {
                        first_suspend = Some(suspension);
                        scope.cancel();
                    }
                }
                NodeOutcome::Cancelled => saw_cancelled = true,
            }
        }

        // Failure outranks suspension, which outranks cancellation.
        if let Some(message) = first_failure {
            NodeOutcome::Failure { message }
        } else if let Some(suspension) = first_suspend {
            NodeOutcome::Suspended(suspension)
        } else if cancel.is_cancelled() || saw_cancelled {
            NodeOutcome::Cancelled
        } else {
            NodeOutcome::Success
        }
    }

    async fn run_step(
        &self,
        step_type_id: &str,
        ctx: &C,
        state: &ExecState,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                state.record(
                    step_type_id,
                    step_type_id,
                    started_at,
                    started,
                    StepTraceStatus::Cancelled,
                    retries,
                    None,
                    None,
                );
                return NodeOutcome::Cancelled;
            }

            // Resolved per attempt so resolvers may hand out scoped
            // instances.
            let step = match self.resolver.resolve(step_type_id) {
                Ok(step) => step,
                Err(e) => {
                    let message = e.to_string();
                    state.record(
                        step_type_id,
                        step_type_id,
                        started_at,
                        started,
                        StepTraceStatus::Failed,
                        retries,
                        Some(message.clone()),
                        None,
                    );
                    return NodeOutcome::Failure { message };
                }
            };

            let step_name = step.name().to_string();
            let attempt = async {
                let guarded = async {
                    match AssertUnwindSafe(step.execute(ctx, cancel))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(payload) => StepOutcome::Failure {
                            message: panic_message(payload),
                            should_retry: true,
                            metadata: None,
                        },
                    }
                };
                match step.timeout() {
                    Some(limit) => match tokio::time::timeout(limit, guarded).await {
                        Ok(outcome) => outcome,
                        Err(_) => StepOutcome::Failure {
                            message: format!(
                                "Step '{}' timed out after {:?}",
                                step_name, limit
                            ),
                            should_retry: true,
                            metadata: None,
                        },
                    },
                    None => guarded.await,
                }
            };

            let outcome = if state.enable_tracing {
                attempt
                    .instrument(tracing::info_span!(
                        "workflow_step",
                        workflow.id = %state.workflow_id,
                        correlation.id = %state.correlation_id,
                        step = %step_name,
                        retry = retries,
                    ))
                    .await
            } else {
                attempt.await
            };

            match signal::normalize(outcome) {
                StepOutcome::Success { metadata } => {
                    state.record(
                        &step_name,
                        step_type_id,
                        started_at,
                        started,
                        StepTraceStatus::Completed,
                        retries,
                        None,
                        metadata,
                    );
                    return NodeOutcome::Success;
                }
                StepOutcome::Suspend(suspension) => {
                    state.record(
                        &step_name,
                        step_type_id,
                        started_at,
                        started,
                        StepTraceStatus::Suspended,
                        retries,
                        None,
                        suspension.metadata.clone(),
                    );
                    return NodeOutcome::Suspended(suspension);
                }
                StepOutcome::Failure {
                    message,
                    should_retry,
                    metadata,
                } => {
                    if cancel.is_cancelled() {
                        state.record(
                            &step_name,
                            step_type_id,
                            started_at,
                            started,
                            StepTraceStatus::Cancelled,
                            retries,
                            Some(message),
                            metadata,
                        );
                        return NodeOutcome::Cancelled;
                    }

                    if state.retry.should_retry(retries, should_retry, step.can_retry()) {
                        let delay = state.retry.delay_for(retries);
                        retries += 1;
                        state.counters.lock().unwrap().retries += 1;
                        tracing::debug!(
                            step = %step_name,
                            retry = retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Retrying step after transient failure"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = cancel.cancelled() => {
                                state.record(
                                    &step_name,
                                    step_type_id,
                                    started_at,
                                    started,
                                    StepTraceStatus::Cancelled,
                                    retries,
                                    Some(message),
                                    metadata,
                                );
                                return NodeOutcome::Cancelled;
                            }
                        }
                    }

                    tracing::error!(
                        step = %step_name,
                        error = %message,
                        "Step failed terminally"
                    );
                    state.record(
                        &step_name,
                        step_type_id,
                        started_at,
                        started,
                        StepTraceStatus::Failed,
                        retries,
                        Some(message.clone()),
                        metadata,
                    );
                    return NodeOutcome::Failure { message };
                }
            }
        }
    }
}
