//! Per-query shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ffr_common::{ContextToken, EngineConfig, FfrError, NodeId, Result};

/// One cluster node's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node index in `0..num_nodes`.
    pub id: NodeId,
    /// Fabric address of the node (informational for in-process fabrics).
    pub address: String,
}

/// Per-query shared state: token, node roster, options, and cancel flag.
///
/// Clones share the same underlying state; the step/substep counters are the
/// only mutable pieces besides the cancel flag, and both are atomic.
#[derive(Clone)]
pub struct QueryContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    token: ContextToken,
    self_node: NodeId,
    nodes: Vec<NodeInfo>,
    options: HashMap<String, String>,
    config: EngineConfig,
    step: AtomicU32,
    substep: AtomicU32,
    cancelled: AtomicBool,
}

impl QueryContext {
    /// Create a context for one query on one node of a roster.
    pub fn new(
        token: ContextToken,
        self_node: NodeId,
        nodes: Vec<NodeInfo>,
        options: HashMap<String, String>,
    ) -> Self {
        let config = EngineConfig::default().with_options(&options);
        Self {
            inner: Arc::new(ContextInner {
                token,
                self_node,
                nodes,
                options,
                config,
                step: AtomicU32::new(0),
                substep: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Single-node convenience constructor.
    pub fn single_node(token: ContextToken, options: HashMap<String, String>) -> Self {
        Self::new(
            token,
            NodeId(0),
            vec![NodeInfo {
                id: NodeId(0),
                address: "local".to_string(),
            }],
            options,
        )
    }

    /// Query context token.
    pub fn token(&self) -> ContextToken {
        self.inner.token
    }

    /// This node's id.
    pub fn self_node(&self) -> NodeId {
        self.inner.self_node
    }

    /// This node's index into the roster.
    pub fn self_node_index(&self) -> usize {
        self.inner.self_node.0 as usize
    }

    /// Full node roster, ordered by node id.
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.inner.nodes
    }

    /// Number of nodes participating in the query.
    pub fn num_nodes(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Every node id except this one.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.inner
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| *id != self.inner.self_node)
            .collect()
    }

    /// Effective engine configuration (defaults overlaid with options).
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Raw per-query option map.
    pub fn options(&self) -> &HashMap<String, String> {
        &self.inner.options
    }

    /// Current query step label.
    pub fn step(&self) -> u32 {
        self.inner.step.load(Ordering::Acquire)
    }

    /// Current query substep label.
    pub fn substep(&self) -> u32 {
        self.inner.substep.load(Ordering::Acquire)
    }

    /// Advance the step label, resetting the substep.
    pub fn increment_step(&self) -> u32 {
        self.inner.substep.store(0, Ordering::Release);
        self.inner.step.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Advance the substep label, used to disambiguate message exchanges.
    pub fn increment_substep(&self) -> u32 {
        self.inner.substep.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Request cooperative cancellation of the query.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Error-returning cancellation check for kernel run loops.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FfrError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("token", &self.inner.token)
            .field("self_node", &self.inner.self_node)
            .field("num_nodes", &self.inner.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_cancellation_and_counters() {
        let ctx = QueryContext::single_node(ContextToken(1), HashMap::new());
        let clone = ctx.clone();

        assert_eq!(clone.increment_step(), 1);
        assert_eq!(ctx.step(), 1);

        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_err());
    }

    #[test]
    fn peer_ids_exclude_self() {
        let nodes = vec![
            NodeInfo { id: NodeId(0), address: "a".into() },
            NodeInfo { id: NodeId(1), address: "b".into() },
            NodeInfo { id: NodeId(2), address: "c".into() },
        ];
        let ctx = QueryContext::new(ContextToken(9), NodeId(1), nodes, HashMap::new());
        assert_eq!(ctx.peer_ids(), vec![NodeId(0), NodeId(2)]);
        assert_eq!(ctx.num_nodes(), 3);
    }
}
