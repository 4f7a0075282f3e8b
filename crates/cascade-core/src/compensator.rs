use std::any::type_name;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::resolver::StepResolver;
use crate::result::CompensationFailure;
use crate::step::{panic_message, StepOutcome};
use crate::trace::{StepTrace, StepTraceStatus};

/// Saga rollback over a trace snapshot.
///
/// Runs compensation for every previously completed step in reverse
/// insertion order. Parallel siblings appear in the trace in completion
/// order, so LIFO over the trace reliably undoes observable effects. A
/// failing compensation is recorded and never aborts the loop; only
/// cancellation between compensations stops it early.
pub struct Compensator<'a, C> {
    resolver: &'a dyn StepResolver<C>,
}

impl<'a, C: Send + Sync> Compensator<'a, C> {
    /// Create a compensator over the given resolver.
    pub fn new(resolver: &'a dyn StepResolver<C>) -> Self {
        Self { resolver }
    }

    /// Compensate completed steps in LIFO order; returns the failures.
    pub async fn run(
        &self,
        traces: &[StepTrace],
        ctx: &C,
        cancel: &CancellationToken,
    ) -> Vec<CompensationFailure> {
        let context_type_id = type_name::<C>();
        let mut failures = Vec::new();

        for trace in traces.iter().rev() {
            if trace.status != StepTraceStatus::Completed {
                continue;
            }
            if trace.context_type_id != context_type_id {
                tracing::warn!(
                    step = %trace.step_name,
                    trace_context = %trace.context_type_id,
                    engine_context = %context_type_id,
                    "Skipping compensation for mismatched context type"
                );
                continue;
            }
            if cancel.is_cancelled() {
                tracing::warn!(
                    step = %trace.step_name,
                    "Cancellation fired, stopping remaining compensations"
                );
                break;
            }

            let step = match self.resolver.resolve(&trace.step_type_id) {
                Ok(step) => step,
                Err(e) => {
                    failures.push(CompensationFailure {
                        step_name: trace.step_name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let outcome = AssertUnwindSafe(step.compensate(ctx, cancel))
                .catch_unwind()
                .await;

            match outcome {
                Ok(StepOutcome::Success { .. }) => {
                    tracing::debug!(step = %trace.step_name, "Compensation completed");
                }
                Ok(StepOutcome::Failure { message, .. }) => {
                    tracing::error!(
                        step = %trace.step_name,
                        error = %message,
                        "Compensation failed"
                    );
                    failures.push(CompensationFailure {
                        step_name: trace.step_name.clone(),
                        reason: message,
                    });
                }
                Ok(StepOutcome::Suspend(suspension)) => {
                    // A pause has no meaning during rollback.
                    failures.push(CompensationFailure {
                        step_name: trace.step_name.clone(),
                        reason: format!(
                            "Compensation attempted to suspend on signal '{}'",
                            suspension.signal
                        ),
                    });
                }
                Err(payload) => {
                    let reason = panic_message(payload);
                    tracing::error!(
                        step = %trace.step_name,
                        error = %reason,
                        "Compensation panicked"
                    );
                    failures.push(CompensationFailure {
                        step_name: trace.step_name.clone(),
                        reason,
                    });
                }
            }
        }

        failures
    }
}
