//! The persistent driver: couples the in-memory engine to a state store
//! and a signal delivery path so workflow instances survive suspension.
//!
//! The driver keeps no partial-node state across suspensions. A delivered
//! signal re-invokes the engine from the root; step implementations consult
//! the pending changes folded into the context to elide work they have
//! already done.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cascade_core::definition::WorkflowDefinition;
use cascade_core::engine::{Engine, ExecutionOptions};
use cascade_core::error::{CascadeError, Result};
use cascade_core::result::{WorkflowOutcome, WorkflowResult};

use crate::notify::{NoOpNotifier, SignalNotificationService};
use crate::repository::StateRepository;
use crate::state::{InstanceState, InstanceStatus};

/// Context requirements for durable execution.
///
/// The driver snapshots the context into the instance state at every
/// persisted transition and rehydrates it after a process restart.
/// `apply_signal` folds a delivered payload into the context before the
/// replay from the root.
pub trait InstanceContext: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Record a delivered signal payload on the context.
    fn apply_signal(&self, signal: &str, payload: serde_json::Value);
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Deadline applied to a suspension whose step supplied none.
    pub default_signal_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_signal_timeout: Duration::from_secs(86400), // 24 hours
        }
    }
}

/// What a signal delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The instance resumed and ran to its next terminal state or pause.
    Resumed,
    /// The instance was not waiting for this signal.
    Ignored,
    /// The signal arrived after its deadline; the sweeper will cancel.
    TimedOut,
    /// No such instance.
    NotFound,
}

struct ActiveInstance<C> {
    context: Arc<C>,
    cancel: CancellationToken,
}

/// Durable front of the engine: start, signal, cancel, and inspect
/// workflow instances across process lifetimes.
///
/// At most one engine invocation is in flight per instance; a per-instance
/// mutex is held from start or signal until the invocation reaches a
/// terminal state or a suspension. Concurrency across instances is
/// unbounded.
pub struct PersistentDriver<C: InstanceContext> {
    engine: Engine<C>,
    repository: Arc<dyn StateRepository>,
    notifier: Arc<dyn SignalNotificationService>,
    config: DriverConfig,
    options: ExecutionOptions,
    definitions: StdMutex<HashMap<String, Arc<WorkflowDefinition<C>>>>,
    active: StdMutex<HashMap<Uuid, ActiveInstance<C>>>,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<C: InstanceContext> PersistentDriver<C> {
    /// Create a driver over an engine and a state repository.
    pub fn new(engine: Engine<C>, repository: Arc<dyn StateRepository>) -> Self {
        Self {
            engine,
            repository,
            notifier: Arc::new(NoOpNotifier),
            config: DriverConfig::default(),
            options: ExecutionOptions::default(),
            definitions: StdMutex::new(HashMap::new()),
            active: StdMutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Attach a notification sink.
    pub fn with_notifier(mut self, notifier: Arc<dyn SignalNotificationService>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Override the driver configuration.
    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Base execution options applied to every invocation.
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a definition so signals can resume its instances, also
    /// after a process restart.
    pub fn register(&self, definition: Arc<WorkflowDefinition<C>>) {
        self.definitions
            .lock()
            .unwrap()
            .insert(definition.workflow_id.clone(), definition);
    }

    /// Start a new instance and run it to its first terminal state or
    /// suspension.
    pub async fn start(
        &self,
        definition: Arc<WorkflowDefinition<C>>,
        context: Arc<C>,
        created_by: Option<String>,
    ) -> Result<Uuid> {
        self.register(definition.clone());

        let context_json = serde_json::to_value(context.as_ref())?;
        let mut state = InstanceState::new(
            definition.workflow_id.clone(),
            definition.display_name.clone(),
            context_json,
        );
        state.created_by = created_by;
        let instance_id = state.instance_id;

        let cancel = CancellationToken::new();
        self.active.lock().unwrap().insert(
            instance_id,
            ActiveInstance {
                context: context.clone(),
                cancel: cancel.clone(),
            },
        );

        self.repository.create(&state).await?;
        tracing::info!(
            instance_id = %instance_id,
            workflow.id = %definition.workflow_id,
            "Workflow instance started"
        );

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let result = self
            .engine
            .execute(
                &definition,
                context,
                self.invocation_options(),
                cancel.child_token(),
            )
            .await;
        self.persist_result(&mut state, &result).await?;

        Ok(instance_id)
    }

    /// Deliver a signal to a waiting instance.
    pub async fn signal(
        &self,
        instance_id: Uuid,
        signal_name: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<SignalOutcome> {
        let Some(state) = self.repository.load(instance_id).await? else {
            return Ok(SignalOutcome::NotFound);
        };
        if state.status != InstanceStatus::WaitingForSignal
            || state.waiting_for_signal.as_deref() != Some(signal_name)
        {
            tracing::debug!(
                instance_id = %instance_id,
                signal = %signal_name,
                status = state.status.as_str(),
                "Signal ignored"
            );
            return Ok(SignalOutcome::Ignored);
        }
        if state.signal_timeout_at.is_some_and(|at| at < Utc::now()) {
            return Ok(SignalOutcome::TimedOut);
        }

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        // Re-check under the lock; a concurrent delivery may have won.
        let Some(mut state) = self.repository.load(instance_id).await? else {
            return Ok(SignalOutcome::NotFound);
        };
        if state.status != InstanceStatus::WaitingForSignal
            || state.waiting_for_signal.as_deref() != Some(signal_name)
        {
            return Ok(SignalOutcome::Ignored);
        }

        let definition = self
            .definitions
            .lock()
            .unwrap()
            .get(&state.workflow_id)
            .cloned()
            .ok_or_else(|| {
                CascadeError::InvalidState(format!(
                    "No definition registered for workflow '{}'",
                    state.workflow_id
                ))
            })?;

        let (context, cancel) = self.revive_context(instance_id, &state)?;

        let payload_value = payload.unwrap_or(serde_json::Value::Null);
        state
            .pending_changes
            .insert(signal_name.to_string(), payload_value.clone());
        context.apply_signal(signal_name, payload_value);

        state.resume();
        state.context = serde_json::to_value(context.as_ref())?;
        state.updated_at = self.repository.update(&state).await?;
        tracing::info!(
            instance_id = %instance_id,
            signal = %signal_name,
            "Instance resumed by signal"
        );

        let result = self
            .engine
            .execute(
                &definition,
                context,
                self.invocation_options(),
                cancel.child_token(),
            )
            .await;
        self.persist_result(&mut state, &result).await?;

        Ok(SignalOutcome::Resumed)
    }

    /// Cancel an instance. Returns false when it is already terminal or
    /// unknown.
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<bool> {
        let Some(state) = self.repository.load(instance_id).await? else {
            return Ok(false);
        };
        if state.status.is_terminal() {
            return Ok(false);
        }

        // Wake any in-flight invocation before queueing on its lock.
        if let Some(active) = self.active.lock().unwrap().get(&instance_id) {
            active.cancel.cancel();
        }

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let Some(mut state) = self.repository.load(instance_id).await? else {
            return Ok(false);
        };
        match state.status {
            // The in-flight invocation observed the token and already
            // persisted the cancellation.
            InstanceStatus::Cancelled => Ok(true),
            status if status.is_terminal() => Ok(false),
            _ => {
                state.cancel();
                state.updated_at = self.repository.update(&state).await?;
                self.release_instance(instance_id);
                tracing::warn!(
                    instance_id = %instance_id,
                    reason = %reason,
                    "Workflow instance cancelled"
                );
                Ok(true)
            }
        }
    }

    /// Load the current state of an instance.
    pub async fn get_status(&self, instance_id: Uuid) -> Result<InstanceState> {
        self.repository
            .load(instance_id)
            .await?
            .ok_or_else(|| CascadeError::NotFound(format!("Instance {} not found", instance_id)))
    }

    fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn invocation_options(&self) -> ExecutionOptions {
        let mut options = self.options.clone();
        // History persistence needs the snapshot on every result.
        options.enable_execution_tracing = true;
        options
    }

    /// Live context and token for the instance, rehydrating from the
    /// persisted snapshot after a process restart.
    fn revive_context(
        &self,
        instance_id: Uuid,
        state: &InstanceState,
    ) -> Result<(Arc<C>, CancellationToken)> {
        let mut active = self.active.lock().unwrap();
        if let Some(entry) = active.get(&instance_id) {
            return Ok((entry.context.clone(), entry.cancel.clone()));
        }

        let context: Arc<C> = Arc::new(serde_json::from_value(state.context.clone())?);
        let cancel = CancellationToken::new();
        active.insert(
            instance_id,
            ActiveInstance {
                context: context.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok((context, cancel))
    }

    fn release_instance(&self, instance_id: Uuid) {
        self.active.lock().unwrap().remove(&instance_id);
        self.locks.lock().unwrap().remove(&instance_id);
    }

    async fn persist_result(
        &self,
        state: &mut InstanceState,
        result: &WorkflowResult<C>,
    ) -> Result<()> {
        if let Some(traces) = &result.traces {
            state.history.extend(traces.iter().cloned());
        }
        state.current_step = state.history.last().map(|t| t.step_name.clone());
        state.context = serde_json::to_value(result.context.as_ref())?;

        match &result.outcome {
            WorkflowOutcome::Success => {
                state.complete();
                if let Err(e) = self
                    .notifier
                    .notify_completed(state.instance_id, &state.workflow_id)
                    .await
                {
                    tracing::warn!(error = %e, "Completion notification failed");
                }
            }
            WorkflowOutcome::Failure { error_message, .. } => {
                state.fail();
                if let Err(e) = self
                    .notifier
                    .notify_errored(state.instance_id, &state.workflow_id, error_message)
                    .await
                {
                    tracing::warn!(error = %e, "Error notification failed");
                }
            }
            WorkflowOutcome::Cancelled => state.cancel(),
            WorkflowOutcome::TimedOut => state.time_out(),
            WorkflowOutcome::Suspended(suspension) => {
                let deadline = suspension.timeout_at.unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(self.config.default_signal_timeout)
                            .unwrap_or_else(|_| chrono::Duration::hours(24))
                });
                state.wait_for_signal(suspension.signal.clone(), deadline);
                if let Err(e) = self
                    .notifier
                    .notify_approval_requested(
                        state.instance_id,
                        &state.workflow_id,
                        &suspension.signal,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Approval notification failed");
                }
            }
        }

        state.updated_at = self.repository.update(state).await?;
        if state.status.is_terminal() {
            self.release_instance(state.instance_id);
        }
        Ok(())
    }
}
