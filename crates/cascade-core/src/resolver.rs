use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CascadeError, Result};
use crate::step::WorkflowStep;

/// Resolves a step instance from its type id.
///
/// Resolution happens per attempt so implementations may hand out scoped
/// instances. Implementations may cache within an invocation but must not
/// cache across invocations of the persistent driver.
pub trait StepResolver<C>: Send + Sync {
    /// Resolve the step registered under `step_type_id`.
    fn resolve(&self, step_type_id: &str) -> Result<Arc<dyn WorkflowStep<C>>>;
}

/// In-memory step registry keyed by type id.
pub struct StepRegistry<C> {
    steps: HashMap<String, Arc<dyn WorkflowStep<C>>>,
}

impl<C> StepRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Register a step under a type id.
    pub fn register<S>(&mut self, step_type_id: impl Into<String>, step: S)
    where
        S: WorkflowStep<C> + 'static,
    {
        self.steps.insert(step_type_id.into(), Arc::new(step));
    }

    /// Register an already-shared step instance.
    pub fn register_arc(&mut self, step_type_id: impl Into<String>, step: Arc<dyn WorkflowStep<C>>) {
        self.steps.insert(step_type_id.into(), step);
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All registered type ids.
    pub fn type_ids(&self) -> Vec<&str> {
        self.steps.keys().map(|s| s.as_str()).collect()
    }
}

impl<C> Default for StepRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StepResolver<C> for StepRegistry<C> {
    fn resolve(&self, step_type_id: &str) -> Result<Arc<dyn WorkflowStep<C>>> {
        self.steps
            .get(step_type_id)
            .cloned()
            .ok_or_else(|| CascadeError::Unresolved(step_type_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepFuture, StepOutcome};
    use tokio_util::sync::CancellationToken;

    struct NoopStep;

    impl WorkflowStep<()> for NoopStep {
        fn name(&self) -> &str {
            "noop"
        }

        fn execute<'a>(&'a self, _ctx: &'a (), _cancel: &'a CancellationToken) -> StepFuture<'a> {
            Box::pin(async { StepOutcome::success() })
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry: StepRegistry<()> = StepRegistry::new();
        assert!(registry.is_empty());

        registry.register("noop", NoopStep);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.type_ids(), vec!["noop"]);

        let step = registry.resolve("noop").unwrap();
        assert_eq!(step.name(), "noop");
    }

    #[test]
    fn test_unresolved_type_id() {
        let registry: StepRegistry<()> = StepRegistry::new();
        match registry.resolve("missing") {
            Err(CascadeError::Unresolved(id)) => assert_eq!(id, "missing"),
            other => panic!("Expected Unresolved, got {:?}", other.map(|_| ())),
        }
    }
}
