//! Core tree data structures and the read-only query trait.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Following the usual
//! convention for inference engines, external nodes (tips) occupy the
//! indices `0..external_node_count()` and internal nodes follow.

use std::collections::BTreeMap;

/// Index into a tree's node arena.
pub type NodeId = usize;

/// An open-ended per-node annotation value (rates, trait values,
/// markov-jump counts).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AttrValue {
    Real(f64),
    Int(i64),
    Text(String),
    Boolean(bool),
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Real(v) => write!(f, "{}", v),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Text(v) => write!(f, "{}", v),
            AttrValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

/// A single node in a rooted tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes, in order.
    pub children: Vec<NodeId>,
    /// Height of the node in time units; the root is the oldest node.
    pub height: f64,
    /// Index into the taxon list (external nodes only).
    pub taxon: Option<usize>,
    /// Open-ended annotation map.
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_external(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Read-only queries over a rooted tree.
///
/// The pure traversal algorithms in [`crate::tree_utils`] are written
/// against this trait, so they work over [`crate::tree_model::TreeModel`]
/// and any other conforming structure. Implementations must uphold the
/// tree invariants: exactly one root, every non-root node has exactly
/// one parent, and `node_height(parent(n)) >= node_height(n)` for all
/// non-root `n`.
pub trait Tree {
    /// The root node.
    fn root(&self) -> NodeId;

    /// Total number of nodes (external + internal).
    fn node_count(&self) -> usize;

    /// Number of external nodes (tips).
    fn external_node_count(&self) -> usize;

    /// Number of internal nodes.
    fn internal_node_count(&self) -> usize {
        self.node_count() - self.external_node_count()
    }

    /// Parent of `node`, or `None` for the root.
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Number of children of `node`.
    fn child_count(&self, node: NodeId) -> usize;

    /// The `index`th child of `node`.
    fn child(&self, node: NodeId, index: usize) -> NodeId;

    /// Height of `node` in time units.
    fn node_height(&self, node: NodeId) -> f64;

    /// Taxon index of `node` (external nodes only).
    fn taxon(&self, node: NodeId) -> Option<usize>;

    /// Number of taxa associated with this tree.
    fn taxon_count(&self) -> usize;

    /// Label of the `index`th taxon.
    fn taxon_label(&self, index: usize) -> &str;

    /// Named annotation of `node`, if present.
    fn node_attribute(&self, node: NodeId, key: &str) -> Option<&AttrValue>;

    /// Taxon label of `node`, if it is a tip with an assigned taxon.
    fn taxon_id(&self, node: NodeId) -> Option<&str> {
        self.taxon(node).map(|t| self.taxon_label(t))
    }

    /// True if `node` has no children.
    fn is_external(&self, node: NodeId) -> bool {
        self.child_count(node) == 0
    }

    /// True if `node` is the root.
    fn is_root(&self, node: NodeId) -> bool {
        node == self.root()
    }

    /// Length of the branch from `node` to its parent in time units
    /// (zero for the root).
    fn branch_length(&self, node: NodeId) -> f64 {
        match self.parent(node) {
            Some(p) => self.node_height(p) - self.node_height(node),
            None => 0.0,
        }
    }
}
