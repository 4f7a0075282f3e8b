use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a node instance within a compiled graph.
///
/// Revisit detection uses this identity, not the step type id, so the same
/// step type may appear in multiple nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Predicate evaluated by conditional nodes. Non-blocking and total.
pub type Predicate<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// An element of the compiled workflow graph.
///
/// The graph is a tree of exclusive ownership: every child belongs to
/// exactly one parent, so it is acyclic by construction. Only step nodes
/// contribute trace entries; the other variants are pure control flow.
pub enum Node<C> {
    /// Leaf node. The step instance is resolved through the step resolver
    /// on every attempt.
    Step { id: NodeId, step_type_id: String },
    /// Ordered children; short-circuits on the first non-success.
    Sequence { id: NodeId, children: Vec<Node<C>> },
    /// Concurrent children with wait-all semantics.
    Parallel {
        id: NodeId,
        children: Vec<Node<C>>,
        max_concurrency: Option<usize>,
    },
    /// Branch on a context predicate. A missing else-branch on a false
    /// predicate is a no-op success.
    Conditional {
        id: NodeId,
        predicate: Predicate<C>,
        then_branch: Box<Node<C>>,
        else_branch: Option<Box<Node<C>>>,
    },
    /// Cancellable sleep, then the next node.
    Delay {
        id: NodeId,
        duration: Duration,
        next: Box<Node<C>>,
    },
}

impl<C> Node<C> {
    /// Leaf step node for the given step type id.
    pub fn step(step_type_id: impl Into<String>) -> Self {
        Self::Step {
            id: NodeId::next(),
            step_type_id: step_type_id.into(),
        }
    }

    /// Ordered sequence of children.
    pub fn sequence(children: Vec<Node<C>>) -> Self {
        Self::Sequence {
            id: NodeId::next(),
            children,
        }
    }

    /// Concurrent children, unbounded concurrency.
    pub fn parallel(children: Vec<Node<C>>) -> Self {
        Self::Parallel {
            id: NodeId::next(),
            children,
            max_concurrency: None,
        }
    }

    /// Concurrent children capped at `max_concurrency` in flight.
    pub fn parallel_bounded(children: Vec<Node<C>>, max_concurrency: usize) -> Self {
        Self::Parallel {
            id: NodeId::next(),
            children,
            max_concurrency: Some(max_concurrency),
        }
    }

    /// Conditional branch.
    pub fn conditional<P>(predicate: P, then_branch: Node<C>, else_branch: Option<Node<C>>) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
    {
        Self::Conditional {
            id: NodeId::next(),
            predicate: Arc::new(predicate),
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        }
    }

    /// Sleep for `duration`, then run `next`.
    pub fn delay(duration: Duration, next: Node<C>) -> Self {
        Self::Delay {
            id: NodeId::next(),
            duration,
            next: Box::new(next),
        }
    }

    /// Identity of this node instance.
    pub fn id(&self) -> NodeId {
        match self {
            Self::Step { id, .. }
            | Self::Sequence { id, .. }
            | Self::Parallel { id, .. }
            | Self::Conditional { id, .. }
            | Self::Delay { id, .. } => *id,
        }
    }

    /// Variant name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step",
            Self::Sequence { .. } => "sequence",
            Self::Parallel { .. } => "parallel",
            Self::Conditional { .. } => "conditional",
            Self::Delay { .. } => "delay",
        }
    }
}

impl<C> fmt::Debug for Node<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step { id, step_type_id } => f
                .debug_struct("Step")
                .field("id", id)
                .field("step_type_id", step_type_id)
                .finish(),
            Self::Sequence { id, children } => f
                .debug_struct("Sequence")
                .field("id", id)
                .field("children", &children.len())
                .finish(),
            Self::Parallel {
                id,
                children,
                max_concurrency,
            } => f
                .debug_struct("Parallel")
                .field("id", id)
                .field("children", &children.len())
                .field("max_concurrency", max_concurrency)
                .finish(),
            Self::Conditional { id, else_branch, .. } => f
                .debug_struct("Conditional")
                .field("id", id)
                .field("has_else", &else_branch.is_some())
                .finish(),
            Self::Delay { id, duration, .. } => f
                .debug_struct("Delay")
                .field("id", id)
                .field("duration", duration)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_distinct() {
        let a: Node<()> = Node::step("a");
        let b: Node<()> = Node::step("a");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_node_kinds() {
        let step: Node<()> = Node::step("x");
        assert_eq!(step.kind(), "step");

        let seq: Node<()> = Node::sequence(vec![Node::step("a"), Node::step("b")]);
        assert_eq!(seq.kind(), "sequence");

        let par: Node<()> = Node::parallel_bounded(vec![Node::step("a")], 2);
        assert_eq!(par.kind(), "parallel");
        match par {
            Node::Parallel {
                max_concurrency, ..
            } => assert_eq!(max_concurrency, Some(2)),
            _ => panic!("Expected parallel"),
        }

        let cond: Node<()> = Node::conditional(|_| true, Node::step("t"), None);
        assert_eq!(cond.kind(), "conditional");

        let delay: Node<()> = Node::delay(Duration::from_millis(5), Node::step("n"));
        assert_eq!(delay.kind(), "delay");
    }

    #[test]
    fn test_conditional_predicate_reads_context() {
        struct Ctx {
            flag: bool,
        }

        let node: Node<Ctx> = Node::conditional(|c: &Ctx| c.flag, Node::step("t"), None);
        match node {
            Node::Conditional { predicate, .. } => {
                assert!(predicate(&Ctx { flag: true }));
                assert!(!predicate(&Ctx { flag: false }));
            }
            _ => panic!("Expected conditional"),
        }
    }
}
