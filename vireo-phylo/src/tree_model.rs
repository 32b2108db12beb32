//! Mutable tree model with change events and reversible state.
//!
//! `TreeModel` owns the node arena and supports the in-place edits
//! MCMC operators make: height changes, child reattachment, and root
//! replacement. Every mutation records a [`TreeChangedEvent`]; the
//! single orchestrator that owns the model (normally a likelihood)
//! drains the event queue with [`TreeModel::take_events`] before any
//! cached read, which in this single-threaded engine gives the same
//! observable ordering as synchronous listener callbacks.
//!
//! Topology edits are bracketed by [`TreeModel::begin_edit`] /
//! [`TreeModel::end_edit`]: the tree invariants may be violated
//! transiently between the brackets and are re-validated in full when
//! the bracket closes.

use std::collections::BTreeMap;

use vireo_core::{Result, Summarizable, VireoError};

use crate::state::Stateful;
use crate::tree::{AttrValue, Node, NodeId, Tree};

/// The shape of a change to the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Only a node height moved; topology is unchanged.
    Height,
    /// Parent/child structure changed at the node.
    Topology,
}

/// A change notification recorded by a mutation.
///
/// `node` is `None` when every node may have changed (wholesale
/// topology replacement, e.g. a restore).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeChangedEvent {
    pub node: Option<NodeId>,
    pub kind: ChangeKind,
}

/// Per-node snapshot used by store/restore.
#[derive(Debug, Clone)]
struct NodeShape {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    height: f64,
}

#[derive(Debug, Clone)]
struct TreeSnapshot {
    shapes: Vec<NodeShape>,
    root: NodeId,
}

/// A mutable rooted tree with stable node indices.
///
/// External nodes occupy indices `0..external_node_count()`; internal
/// nodes follow. Created once per analysis and mutated by every
/// proposed MCMC step; see the module docs for the edit protocol.
#[derive(Debug, Clone)]
pub struct TreeModel {
    id: String,
    nodes: Vec<Node>,
    root: NodeId,
    external_count: usize,
    taxa: Vec<String>,
    events: Vec<TreeChangedEvent>,
    in_edit: bool,
    edited: Vec<NodeId>,
    stored: Option<TreeSnapshot>,
}

impl TreeModel {
    /// Identifier used in diagnostics.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All taxon labels, indexed by taxon number.
    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    /// Immutable access to a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Set a node annotation.
    pub fn set_node_attribute(&mut self, node: NodeId, key: &str, value: AttrValue) {
        self.nodes[node].attributes.insert(key.to_string(), value);
    }

    /// Drain the change events recorded since the last drain.
    pub fn take_events(&mut self) -> Vec<TreeChangedEvent> {
        std::mem::take(&mut self.events)
    }

    /// Change the height of a node.
    ///
    /// The new height must not invert a branch: it must be at least
    /// the height of every child and at most the height of the parent.
    /// A violation is a fatal geometry error.
    pub fn set_node_height(&mut self, node: NodeId, height: f64) -> Result<()> {
        self.check_node(node);
        for &c in &self.nodes[node].children {
            if self.nodes[c].height > height {
                return Err(VireoError::Structural(format!(
                    "tree {}: height {} at node {} would fall below child {} at {}",
                    self.id, height, node, c, self.nodes[c].height
                )));
            }
        }
        if let Some(p) = self.nodes[node].parent {
            if self.nodes[p].height < height {
                return Err(VireoError::Structural(format!(
                    "tree {}: height {} at node {} would exceed parent {} at {}",
                    self.id, height, node, p, self.nodes[p].height
                )));
            }
        }
        self.nodes[node].height = height;
        self.events.push(TreeChangedEvent {
            node: Some(node),
            kind: ChangeKind::Height,
        });
        Ok(())
    }

    /// Open a topology-edit bracket.
    pub fn begin_edit(&mut self) -> Result<()> {
        if self.in_edit {
            return Err(VireoError::InvalidOperation {
                target: self.id.clone(),
                operation: "begin_edit inside an open edit".into(),
            });
        }
        self.in_edit = true;
        self.edited.clear();
        Ok(())
    }

    /// Detach `child` from `parent`, leaving it temporarily orphaned.
    /// Only legal inside an edit bracket.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit("remove_child")?;
        self.check_node(parent);
        self.check_node(child);
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .ok_or_else(|| {
                VireoError::Structural(format!(
                    "tree {}: node {} is not a child of {}",
                    self.id, child, parent
                ))
            })?;
        self.nodes[parent].children.remove(pos);
        self.nodes[child].parent = None;
        self.touch(parent);
        self.touch(child);
        Ok(())
    }

    /// Attach the orphaned node `child` under `parent`.
    /// Only legal inside an edit bracket.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit("add_child")?;
        self.check_node(parent);
        self.check_node(child);
        if self.nodes[child].parent.is_some() {
            return Err(VireoError::Structural(format!(
                "tree {}: node {} already has a parent",
                self.id, child
            )));
        }
        self.nodes[parent].children.push(child);
        self.nodes[child].parent = Some(parent);
        self.touch(parent);
        self.touch(child);
        Ok(())
    }

    /// Replace the full child list of `parent`. The new children must
    /// currently be orphans; the old children become orphans.
    pub fn replace_children(&mut self, parent: NodeId, children: &[NodeId]) -> Result<()> {
        self.require_edit("replace_children")?;
        let old: Vec<NodeId> = self.nodes[parent].children.clone();
        for &c in &old {
            self.remove_child(parent, c)?;
        }
        for &c in children {
            self.add_child(parent, c)?;
        }
        Ok(())
    }

    /// Declare a new root node. Only legal inside an edit bracket.
    pub fn set_root(&mut self, node: NodeId) -> Result<()> {
        self.require_edit("set_root")?;
        self.check_node(node);
        self.root = node;
        self.touch(node);
        Ok(())
    }

    /// Close the edit bracket, validating the whole tree and emitting
    /// topology events for every node touched during the edit.
    pub fn end_edit(&mut self) -> Result<()> {
        if !self.in_edit {
            return Err(VireoError::InvalidOperation {
                target: self.id.clone(),
                operation: "end_edit without begin_edit".into(),
            });
        }
        self.in_edit = false;
        self.validate()?;
        for &n in &self.edited {
            self.events.push(TreeChangedEvent {
                node: Some(n),
                kind: ChangeKind::Topology,
            });
        }
        self.edited.clear();
        Ok(())
    }

    /// Full structural validation: single root, consistent
    /// parent/child links, all nodes reachable, monotone heights.
    fn validate(&self) -> Result<()> {
        if self.nodes[self.root].parent.is_some() {
            return Err(VireoError::Structural(format!(
                "tree {}: root {} has a parent",
                self.id, self.root
            )));
        }
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![self.root];
        let mut reached = 0usize;
        while let Some(n) = stack.pop() {
            if seen[n] {
                return Err(VireoError::Structural(format!(
                    "tree {}: node {} reached twice (cyclic link)",
                    self.id, n
                )));
            }
            seen[n] = true;
            reached += 1;
            for &c in &self.nodes[n].children {
                if self.nodes[c].parent != Some(n) {
                    return Err(VireoError::Structural(format!(
                        "tree {}: child {} of {} has inconsistent parent link",
                        self.id, c, n
                    )));
                }
                if self.nodes[c].height > self.nodes[n].height {
                    return Err(VireoError::Structural(format!(
                        "tree {}: negative branch length between {} and child {}",
                        self.id, n, c
                    )));
                }
                stack.push(c);
            }
        }
        if reached != self.nodes.len() {
            return Err(VireoError::Structural(format!(
                "tree {}: {} of {} nodes unreachable from root (orphaned subtree)",
                self.id,
                self.nodes.len() - reached,
                self.nodes.len()
            )));
        }
        Ok(())
    }

    fn require_edit(&self, op: &str) -> Result<()> {
        if !self.in_edit {
            return Err(VireoError::InvalidOperation {
                target: self.id.clone(),
                operation: format!("{} outside an edit bracket", op),
            });
        }
        Ok(())
    }

    fn touch(&mut self, node: NodeId) {
        if !self.edited.contains(&node) {
            self.edited.push(node);
        }
    }

    #[track_caller]
    fn check_node(&self, node: NodeId) {
        assert!(
            node < self.nodes.len(),
            "node {} does not belong to tree {} ({} nodes)",
            node,
            self.id,
            self.nodes.len()
        );
    }
}

impl Tree for TreeModel {
    fn root(&self) -> NodeId {
        self.root
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn external_node_count(&self) -> usize {
        self.external_count
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    fn child_count(&self, node: NodeId) -> usize {
        self.nodes[node].children.len()
    }

    fn child(&self, node: NodeId, index: usize) -> NodeId {
        self.nodes[node].children[index]
    }

    fn node_height(&self, node: NodeId) -> f64 {
        self.nodes[node].height
    }

    fn taxon(&self, node: NodeId) -> Option<usize> {
        self.nodes[node].taxon
    }

    fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    fn taxon_label(&self, index: usize) -> &str {
        &self.taxa[index]
    }

    fn node_attribute(&self, node: NodeId, key: &str) -> Option<&AttrValue> {
        self.nodes[node].attributes.get(key)
    }
}

impl Stateful for TreeModel {
    fn store_state(&mut self) {
        assert!(
            self.stored.is_none(),
            "tree {}: store_state while a snapshot is already held",
            self.id
        );
        self.stored = Some(TreeSnapshot {
            shapes: self
                .nodes
                .iter()
                .map(|n| NodeShape {
                    parent: n.parent,
                    children: n.children.clone(),
                    height: n.height,
                })
                .collect(),
            root: self.root,
        });
    }

    fn restore_state(&mut self) {
        let snap = self
            .stored
            .take()
            .unwrap_or_else(|| panic!("tree {}: restore_state without a snapshot", self.id));
        for (node, shape) in self.nodes.iter_mut().zip(snap.shapes) {
            node.parent = shape.parent;
            node.children = shape.children;
            node.height = shape.height;
        }
        self.root = snap.root;
        self.in_edit = false;
        self.edited.clear();
        self.events.clear();
    }

    fn accept_state(&mut self) {
        assert!(
            self.stored.take().is_some(),
            "tree {}: accept_state without a snapshot",
            self.id
        );
    }
}

impl Summarizable for TreeModel {
    fn summary(&self) -> String {
        format!(
            "TreeModel({}): {} nodes ({} tips, {} internal)",
            self.id,
            self.node_count(),
            self.external_node_count(),
            self.internal_node_count()
        )
    }
}

/// Incrementally builds a [`TreeModel`] from tips and joins.
///
/// Tips and internal nodes may be declared in any order; on `build()`
/// the nodes are renumbered so tips come first, in declaration order.
pub struct TreeBuilder {
    id: String,
    tips: Vec<(String, f64)>,
    joins: Vec<(Vec<BuilderNode>, f64)>,
}

/// Opaque handle for a node under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderNode {
    Tip(usize),
    Internal(usize),
}

impl TreeBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tips: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Declare a tip with the given taxon label and height.
    pub fn tip(&mut self, label: &str, height: f64) -> BuilderNode {
        self.tips.push((label.to_string(), height));
        BuilderNode::Tip(self.tips.len() - 1)
    }

    /// Join previously declared nodes under a new internal node.
    pub fn join(&mut self, children: &[BuilderNode], height: f64) -> BuilderNode {
        self.joins.push((children.to_vec(), height));
        BuilderNode::Internal(self.joins.len() - 1)
    }

    /// Finish construction, validating all tree invariants.
    pub fn build(self) -> Result<TreeModel> {
        if self.tips.is_empty() {
            return Err(VireoError::InvalidInput("tree has no tips".into()));
        }
        let mut labels: Vec<&str> = self.tips.iter().map(|(l, _)| l.as_str()).collect();
        labels.sort_unstable();
        if labels.windows(2).any(|w| w[0] == w[1]) {
            return Err(VireoError::InvalidInput(format!(
                "tree {}: duplicate taxon label",
                self.id
            )));
        }

        let external = self.tips.len();
        let resolve = |b: BuilderNode| -> NodeId {
            match b {
                BuilderNode::Tip(i) => i,
                BuilderNode::Internal(i) => external + i,
            }
        };

        let mut nodes: Vec<Node> = Vec::with_capacity(external + self.joins.len());
        let mut taxa = Vec::with_capacity(external);
        for (i, (label, height)) in self.tips.iter().enumerate() {
            taxa.push(label.clone());
            nodes.push(Node {
                id: i,
                parent: None,
                children: Vec::new(),
                height: *height,
                taxon: Some(i),
                attributes: BTreeMap::new(),
            });
        }
        for (i, (children, height)) in self.joins.iter().enumerate() {
            let id = external + i;
            nodes.push(Node {
                id,
                parent: None,
                children: children.iter().map(|&c| resolve(c)).collect(),
                height: *height,
                taxon: None,
                attributes: BTreeMap::new(),
            });
        }
        for i in 0..nodes.len() {
            let children = nodes[i].children.clone();
            for c in children {
                if nodes[c].parent.is_some() {
                    return Err(VireoError::Structural(format!(
                        "tree {}: node {} joined twice",
                        self.id, c
                    )));
                }
                nodes[c].parent = Some(i);
            }
        }

        let roots: Vec<NodeId> = nodes
            .iter()
            .filter(|n| n.parent.is_none())
            .map(|n| n.id)
            .collect();
        if roots.len() != 1 {
            return Err(VireoError::Structural(format!(
                "tree {}: expected exactly one root, found {}",
                self.id,
                roots.len()
            )));
        }

        let model = TreeModel {
            id: self.id,
            nodes,
            root: roots[0],
            external_count: external,
            taxa,
            events: Vec::new(),
            in_edit: false,
            edited: Vec::new(),
            stored: None,
        };
        model.validate()?;
        Ok(model)
    }
}
