use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::node::Node;

type RootBuilder<C> = Box<dyn Fn() -> Node<C> + Send + Sync>;

/// A compiled workflow: identity, version, optional timeout, and the root
/// of the node graph.
///
/// The root is materialized lazily, at most once, on first use; subsequent
/// invocations reuse the same graph. Immutable after materialization.
pub struct WorkflowDefinition<C> {
    /// Stable workflow identifier.
    pub workflow_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Definition version.
    pub version: u32,
    /// Default wall-clock cap for the whole workflow. Execution options may
    /// override it per invocation.
    pub timeout: Option<Duration>,
    builder: RootBuilder<C>,
    root: OnceCell<Node<C>>,
}

impl<C> WorkflowDefinition<C> {
    /// Create a definition with a lazy root builder.
    pub fn new<F>(
        workflow_id: impl Into<String>,
        display_name: impl Into<String>,
        builder: F,
    ) -> Self
    where
        F: Fn() -> Node<C> + Send + Sync + 'static,
    {
        Self {
            workflow_id: workflow_id.into(),
            display_name: display_name.into(),
            version: 1,
            timeout: None,
            builder: Box::new(builder),
            root: OnceCell::new(),
        }
    }

    /// Set the definition version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the default workflow timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The compiled root node, built on first access.
    pub fn root(&self) -> &Node<C> {
        self.root.get_or_init(|| (self.builder)())
    }
}

impl<C> std::fmt::Debug for WorkflowDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("workflow_id", &self.workflow_id)
            .field("display_name", &self.display_name)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("materialized", &self.root.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_root_is_built_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();

        let definition: WorkflowDefinition<()> =
            WorkflowDefinition::new("wf.lazy", "Lazy", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Node::step("only")
            });

        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let first = definition.root().id();
        let second = definition.root().id();

        assert_eq!(first, second);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builder_settings() {
        let definition: WorkflowDefinition<()> =
            WorkflowDefinition::new("wf.order", "Order fulfilment", || Node::step("ship"))
                .with_version(3)
                .with_timeout(Duration::from_secs(30));

        assert_eq!(definition.workflow_id, "wf.order");
        assert_eq!(definition.version, 3);
        assert_eq!(definition.timeout, Some(Duration::from_secs(30)));
    }
}
