//! Execution-tree arena.
//!
//! Node executions are persisted as flat records with `parent_id`
//! back-references. Each reconciliation pass loads the records of one plan
//! into an id-indexed map and derives the parent -> children index from it.
//! The arena is read-only: status changes go through the execution store and
//! the next pass rebuilds the tree.

use indexmap::{IndexMap, IndexSet};

use crate::execution::NodeExecution;
use crate::id::NodeExecutionId;

/// Read-only arena over the node executions of one plan
#[derive(Debug, Clone, Default)]
pub struct ExecutionTree {
    nodes: IndexMap<NodeExecutionId, NodeExecution>,
    children: IndexMap<NodeExecutionId, Vec<NodeExecutionId>>,
}

impl ExecutionTree {
    /// Build the arena, skipping executions superseded by a retry
    #[must_use]
    pub fn build<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeExecution>,
    {
        let nodes: IndexMap<NodeExecutionId, NodeExecution> = nodes
            .into_iter()
            .filter(|n| !n.old_retry)
            .map(|n| (n.id, n))
            .collect();

        let mut children: IndexMap<NodeExecutionId, Vec<NodeExecutionId>> = IndexMap::new();
        for node in nodes.values() {
            if let Some(parent) = node.parent_id {
                if nodes.contains_key(&parent) {
                    children.entry(parent).or_default().push(node.id);
                }
            }
        }

        Self { nodes, children }
    }

    /// Number of node executions in the arena
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node execution
    #[must_use]
    pub fn get(&self, id: NodeExecutionId) -> Option<&NodeExecution> {
        self.nodes.get(&id)
    }

    /// All node executions in load order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeExecution> {
        self.nodes.values()
    }

    /// Direct children of a node execution
    pub fn children(&self, id: NodeExecutionId) -> impl Iterator<Item = &NodeExecution> {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.nodes.get(child))
    }

    /// Parent of a node execution, if it is in the arena
    #[must_use]
    pub fn parent(&self, id: NodeExecutionId) -> Option<&NodeExecution> {
        self.nodes
            .get(&id)
            .and_then(|n| n.parent_id)
            .and_then(|p| self.nodes.get(&p))
    }

    /// Node executions with no parent in the arena
    #[must_use]
    pub fn top_level(&self) -> Vec<&NodeExecution> {
        self.nodes
            .values()
            .filter(|n| n.parent_id.is_none_or(|p| !self.nodes.contains_key(&p)))
            .collect()
    }

    /// Childless node executions whose mode does actual work
    ///
    /// An orchestrating node that has not spawned its children yet is not a
    /// leaf.
    #[must_use]
    pub fn leaves(&self) -> Vec<&NodeExecution> {
        self.nodes.values().filter(|n| self.is_leaf(n)).collect()
    }

    /// Leaves within the subtree rooted at `root`
    #[must_use]
    pub fn leaves_under(&self, root: NodeExecutionId) -> Vec<&NodeExecution> {
        self.subtree(root)
            .into_iter()
            .filter(|n| self.is_leaf(n))
            .collect()
    }

    fn is_leaf(&self, node: &NodeExecution) -> bool {
        node.mode.is_leaf_mode() && !self.children.contains_key(&node.id)
    }

    /// Every node execution in the subtree rooted at `root`, root first
    #[must_use]
    pub fn subtree(&self, root: NodeExecutionId) -> Vec<&NodeExecution> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                out.push(node);
                if let Some(kids) = self.children.get(&id) {
                    stack.extend(kids.iter().rev());
                }
            }
        }
        out
    }

    /// Whether `id` lies in the subtree rooted at `root`
    #[must_use]
    pub fn is_within(&self, root: NodeExecutionId, id: NodeExecutionId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent_id);
        }
        false
    }

    /// Distinct parents of the given node executions, in first-seen order
    #[must_use]
    pub fn parents_of<'a, I>(&self, ids: I) -> Vec<&NodeExecution>
    where
        I: IntoIterator<Item = &'a NodeExecutionId>,
    {
        let mut seen = IndexSet::new();
        for id in ids {
            if let Some(parent) = self.parent(*id) {
                seen.insert(parent.id);
            }
        }
        seen.into_iter().filter_map(|id| self.nodes.get(&id)).collect()
    }

    /// Whether every direct child of `id` has a final status
    #[must_use]
    pub fn all_children_final(&self, id: NodeExecutionId) -> bool {
        self.children(id).all(|c| c.status.is_final())
    }

    /// Whether every node in the subtree rooted at `root` has a final status
    #[must_use]
    pub fn subtree_all_final(&self, root: NodeExecutionId) -> bool {
        self.subtree(root).iter().all(|n| n.status.is_final())
    }

    /// Whether every node execution in the arena has a final status
    #[must_use]
    pub fn all_final(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_final())
    }
}
