//! Partitioned phylogenetic graphs: trees whose nodes may have two
//! parents, with alignment partitions routed along edges.
//!
//! A recombination event gives a lineage two parents, one per
//! partition of the alignment. [`GraphModel`] stores up to two parent
//! slots per node and a set of partition ids on every (child, parent)
//! edge; [`PartitionedLikelihood`] scores one partition at a time,
//! following only the edges that carry it. A node combines partials
//! for partition `p` only when both child edges carry `p`; a node
//! with a single carrying child is a pass-through whose branch
//! rate-time accumulates downward until `p` rejoins. A partition that
//! enters a node and leaves on neither child edge is a structural
//! dead-end and fatal.

use std::collections::BTreeSet;

use log::info;
use vireo_core::{Result, VireoError};

use crate::patterns::SitePatterns;
use crate::rates::SiteRates;
use crate::state::Stateful;
use crate::subst::SubstitutionModel;
use crate::tree::NodeId;

pub type PartitionId = usize;

#[derive(Debug, Clone)]
struct GraphNode {
    // Parent slots; slot 1 is only used by recombination nodes.
    parents: [Option<NodeId>; 2],
    // Partitions carried on the edge to the matching parent slot.
    edge_partitions: [BTreeSet<PartitionId>; 2],
    children: Vec<NodeId>,
    height: f64,
    taxon: Option<usize>,
}

impl GraphNode {
    fn new(height: f64, taxon: Option<usize>) -> Self {
        Self {
            parents: [None, None],
            edge_partitions: [BTreeSet::new(), BTreeSet::new()],
            children: Vec::new(),
            height,
            taxon,
        }
    }
}

/// A rooted graph where recombination nodes carry two parents.
#[derive(Debug, Clone)]
pub struct GraphModel {
    id: String,
    nodes: Vec<GraphNode>,
    taxa: Vec<String>,
    root: Option<NodeId>,
    // Bumped on every mutation; consumers cache against it.
    version: u64,
    stored: Option<(Vec<GraphNode>, Option<NodeId>, u64)>,
}

impl GraphModel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            nodes: Vec::new(),
            taxa: Vec::new(),
            root: None,
            version: 0,
            stored: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn add_tip(&mut self, label: &str, height: f64) -> NodeId {
        let taxon = self.taxa.len();
        self.taxa.push(label.to_string());
        self.nodes.push(GraphNode::new(height, Some(taxon)));
        self.version += 1;
        self.nodes.len() - 1
    }

    pub fn add_node(&mut self, height: f64) -> NodeId {
        self.nodes.push(GraphNode::new(height, None));
        self.version += 1;
        self.nodes.len() - 1
    }

    pub fn is_tip(&self, node: NodeId) -> bool {
        self.nodes[node].taxon.is_some()
    }

    pub fn taxon_label(&self, node: NodeId) -> Option<&str> {
        self.nodes[node].taxon.map(|t| self.taxa[t].as_str())
    }

    pub fn height(&self, node: NodeId) -> f64 {
        self.nodes[node].height
    }

    pub fn set_height(&mut self, node: NodeId, height: f64) {
        self.nodes[node].height = height;
        self.version += 1;
    }

    pub fn child_count(&self, node: NodeId) -> usize {
        self.nodes[node].children.len()
    }

    pub fn child(&self, node: NodeId, i: usize) -> NodeId {
        self.nodes[node].children[i]
    }

    /// Parent in the given slot (slot 1 only for recombination
    /// nodes).
    pub fn parent(&self, node: NodeId, slot: usize) -> Option<NodeId> {
        self.nodes[node].parents[slot]
    }

    pub fn set_root(&mut self, node: NodeId) {
        self.root = Some(node);
        self.version += 1;
    }

    /// Connect `child` under `parent`, carrying the given partitions
    /// on the new edge. Uses the child's first free parent slot.
    pub fn connect(
        &mut self,
        parent: NodeId,
        child: NodeId,
        partitions: &[PartitionId],
    ) -> Result<()> {
        if self.nodes[parent].children.len() >= 2 {
            return Err(VireoError::Structural(format!(
                "graph {}: node {} already has two children",
                self.id, parent
            )));
        }
        let slot = match self.nodes[child].parents.iter().position(|p| p.is_none()) {
            Some(s) => s,
            None => {
                return Err(VireoError::Structural(format!(
                    "graph {}: node {} already has two parents",
                    self.id, child
                )))
            }
        };
        self.nodes[child].parents[slot] = Some(parent);
        self.nodes[child].edge_partitions[slot] = partitions.iter().copied().collect();
        self.nodes[parent].children.push(child);
        self.version += 1;
        Ok(())
    }

    /// Remove the edge between `parent` and `child`, freeing the
    /// child's parent slot and dropping the edge's partitions.
    pub fn disconnect(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let slot = self.nodes[child]
            .parents
            .iter()
            .position(|&s| s == Some(parent))
            .ok_or_else(|| {
                VireoError::Structural(format!(
                    "graph {}: no edge between {} and {}",
                    self.id, parent, child
                ))
            })?;
        self.nodes[child].parents[slot] = None;
        self.nodes[child].edge_partitions[slot].clear();
        self.nodes[parent].children.retain(|&n| n != child);
        self.version += 1;
        Ok(())
    }

    /// True if the (child, parent) edge carries partition `p`.
    pub fn edge_carries(&self, parent: NodeId, child: NodeId, p: PartitionId) -> bool {
        let n = &self.nodes[child];
        (0..2).any(|slot| n.parents[slot] == Some(parent) && n.edge_partitions[slot].contains(&p))
    }

    /// True if any incoming edge of `node` carries partition `p`.
    pub fn node_carries(&self, node: NodeId, p: PartitionId) -> bool {
        let n = &self.nodes[node];
        (0..2).any(|slot| n.parents[slot].is_some() && n.edge_partitions[slot].contains(&p))
    }
}

impl Stateful for GraphModel {
    fn store_state(&mut self) {
        assert!(
            self.stored.is_none(),
            "graph {}: store_state while a snapshot is already held",
            self.id
        );
        self.stored = Some((self.nodes.clone(), self.root, self.version));
    }

    fn restore_state(&mut self) {
        let (nodes, root, version) = self
            .stored
            .take()
            .unwrap_or_else(|| panic!("graph {}: restore_state without a snapshot", self.id));
        self.nodes = nodes;
        self.root = root;
        self.version = version;
    }

    fn accept_state(&mut self) {
        assert!(
            self.stored.take().is_some(),
            "graph {}: accept_state without a snapshot",
            self.id
        );
    }
}

/// Data, model and rate structure scored for one partition.
pub struct PartitionConfig {
    pub patterns: SitePatterns,
    pub model: Box<dyn SubstitutionModel>,
    pub site_rates: SiteRates,
    pub clock_rate: f64,
}

/// One-partition-at-a-time likelihood over a [`GraphModel`].
pub struct PartitionedLikelihood {
    id: String,
    graph: GraphModel,
    partitions: Vec<PartitionConfig>,
    // partials[partition][node]; node storage grows by doubling when
    // the graph grows.
    partials: Vec<Vec<Vec<f64>>>,
    node_capacity: usize,
    cached: Option<(u64, f64)>,
    stored_cached: Option<(u64, f64)>,
}

impl PartitionedLikelihood {
    pub fn new(id: &str, graph: GraphModel, partitions: Vec<PartitionConfig>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(VireoError::InvalidInput(format!(
                "partitioned likelihood {}: no partitions",
                id
            )));
        }
        for (p, cfg) in partitions.iter().enumerate() {
            if cfg.model.state_count() != cfg.patterns.state_count() {
                return Err(VireoError::InvalidInput(format!(
                    "partitioned likelihood {}: partition {} model/pattern state mismatch",
                    id, p
                )));
            }
            if cfg.clock_rate <= 0.0 {
                return Err(VireoError::InvalidInput(format!(
                    "partitioned likelihood {}: partition {} clock rate must be positive",
                    id, p
                )));
            }
        }
        let node_capacity = graph.node_count().next_power_of_two().max(1);
        let partials = partitions
            .iter()
            .map(|cfg| {
                let len = cfg.patterns.pattern_count()
                    * cfg.site_rates.category_count()
                    * cfg.model.state_count();
                vec![vec![0.0; len]; node_capacity]
            })
            .collect();
        info!(
            "partitioned likelihood {}: {} partitions over {} nodes",
            id,
            partitions.len(),
            graph.node_count()
        );
        Ok(Self {
            id: id.to_string(),
            graph,
            partitions,
            partials,
            node_capacity,
            cached: None,
            stored_cached: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut GraphModel {
        &mut self.graph
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Current per-node storage capacity; grows by doubling.
    pub fn node_capacity(&self) -> usize {
        self.node_capacity
    }

    /// Double the node storage until the graph fits.
    fn grow_node_storage(&mut self) {
        while self.node_capacity < self.graph.node_count() {
            self.node_capacity *= 2;
        }
        for (p, cfg) in self.partitions.iter().enumerate() {
            let len = cfg.patterns.pattern_count()
                * cfg.site_rates.category_count()
                * cfg.model.state_count();
            self.partials[p].resize(self.node_capacity, vec![0.0; len]);
        }
    }

    /// Sum of per-partition log-likelihoods; cached against the graph
    /// version, recomputed wholesale after any mutation.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        if let Some((version, logl)) = self.cached {
            if version == self.graph.version() {
                return Ok(logl);
            }
        }
        if self.graph.node_count() > self.node_capacity {
            self.grow_node_storage();
        }
        let root = self.graph.root().ok_or_else(|| {
            VireoError::Structural(format!("partitioned likelihood {}: graph has no root", self.id))
        })?;

        let mut total = 0.0;
        for p in 0..self.partitions.len() {
            total += self.partition_log_likelihood(root, p)?;
        }
        self.cached = Some((self.graph.version(), total));
        Ok(total)
    }

    fn partition_log_likelihood(&mut self, root: NodeId, p: PartitionId) -> Result<f64> {
        self.compute_partials(root, p)?;
        let cfg = &self.partitions[p];
        let ns = cfg.model.state_count();
        let np = cfg.patterns.pattern_count();
        let nc = cfg.site_rates.category_count();
        let freqs = cfg.model.frequencies();
        let rp = &self.partials[p][root];

        let mut total = 0.0;
        for pat in 0..np {
            let mut site = 0.0;
            for c in 0..nc {
                let base = (pat * nc + c) * ns;
                let mut sum = 0.0;
                for s in 0..ns {
                    sum += freqs[s] * rp[base + s];
                }
                site += cfg.site_rates.proportion(c) * sum;
            }
            if site <= 0.0 {
                return Err(VireoError::Numerical(format!(
                    "partitioned likelihood {}: partition {} pattern {} has zero likelihood",
                    self.id, p, pat
                )));
            }
            total += site.ln() * cfg.patterns.weight(pat);
        }
        Ok(total)
    }

    /// Walk down from `child` through pass-through nodes, summing
    /// rate x time, until partition `p` rejoins at a node where both
    /// child edges carry it (or at a tip).
    ///
    /// `parent` is the node the accumulated branch hangs from.
    fn resolve_branch(
        &self,
        parent: NodeId,
        mut child: NodeId,
        p: PartitionId,
    ) -> Result<(NodeId, f64)> {
        let rate = self.partitions[p].clock_rate;
        let mut time = self.graph.height(parent) - self.graph.height(child);
        if time < 0.0 {
            return Err(VireoError::Structural(format!(
                "partitioned likelihood {}: negative branch length between {} and {}",
                self.id, parent, child
            )));
        }
        loop {
            if self.graph.is_tip(child) {
                return Ok((child, time * rate));
            }
            let carriers: Vec<NodeId> = (0..self.graph.child_count(child))
                .map(|i| self.graph.child(child, i))
                .filter(|&c| self.graph.edge_carries(child, c, p))
                .collect();
            match carriers.len() {
                0 => {
                    return Err(VireoError::Structural(format!(
                        "partitioned likelihood {}: partition {} dead-ends at node {}",
                        self.id, p, child
                    )))
                }
                1 => {
                    // Pass-through: the branch spans this node.
                    let next = carriers[0];
                    let segment = self.graph.height(child) - self.graph.height(next);
                    if segment < 0.0 {
                        return Err(VireoError::Structural(format!(
                            "partitioned likelihood {}: negative branch length between {} and {}",
                            self.id, child, next
                        )));
                    }
                    time += segment;
                    child = next;
                }
                _ => return Ok((child, time * rate)),
            }
        }
    }

    /// Compute partials for partition `p` at `node`, which must be a
    /// tip or a node where both child edges carry `p`.
    fn compute_partials(&mut self, node: NodeId, p: PartitionId) -> Result<()> {
        let cfg = &self.partitions[p];
        let ns = cfg.model.state_count();
        let np = cfg.patterns.pattern_count();
        let nc = cfg.site_rates.category_count();

        if self.graph.is_tip(node) {
            let label = self.graph.taxon_label(node).unwrap_or("");
            let taxon = self.partitions[p]
                .patterns
                .taxon_index(label)
                .ok_or_else(|| VireoError::MissingTaxon(label.to_string()))?;
            let mut buf = vec![1.0; np * nc * ns];
            for pat in 0..np {
                let state = self.partitions[p].patterns.state(taxon, pat);
                if state < ns {
                    for c in 0..nc {
                        let base = (pat * nc + c) * ns;
                        for s in 0..ns {
                            buf[base + s] = if s == state { 1.0 } else { 0.0 };
                        }
                    }
                }
            }
            self.partials[p][node] = buf;
            return Ok(());
        }

        let carriers: Vec<NodeId> = (0..self.graph.child_count(node))
            .map(|i| self.graph.child(node, i))
            .filter(|&c| self.graph.edge_carries(node, c, p))
            .collect();
        if carriers.len() < 2 {
            return Err(VireoError::Structural(format!(
                "partitioned likelihood {}: partition {} dead-ends at node {}",
                self.id, p, node
            )));
        }

        // Resolve each carrying edge to its effective descendant and
        // accumulated rate-time, recursing first.
        let mut resolved = Vec::with_capacity(carriers.len());
        for &child in &carriers {
            let (eff, rate_time) = self.resolve_branch(node, child, p)?;
            self.compute_partials(eff, p)?;
            resolved.push((eff, rate_time));
        }

        let cfg = &self.partitions[p];
        let mut out = vec![1.0; np * nc * ns];
        let mut matrix = vec![0.0; ns * ns];
        for &(eff, rate_time) in &resolved {
            for c in 0..nc {
                let distance = rate_time * cfg.site_rates.rate(c);
                cfg.model.transition_probabilities(distance, &mut matrix);
                let child_partials = &self.partials[p][eff];
                for pat in 0..np {
                    let base = (pat * nc + c) * ns;
                    for s in 0..ns {
                        let mut sum = 0.0;
                        for t in 0..ns {
                            sum += matrix[s * ns + t] * child_partials[base + t];
                        }
                        out[base + s] *= sum;
                    }
                }
            }
        }
        self.partials[p][node] = out;
        Ok(())
    }
}

impl Stateful for PartitionedLikelihood {
    fn store_state(&mut self) {
        self.graph.store_state();
        self.stored_cached = self.cached;
    }

    fn restore_state(&mut self) {
        self.graph.restore_state();
        self.cached = self.stored_cached.take();
    }

    fn accept_state(&mut self) {
        self.graph.accept_state();
        self.stored_cached = None;
    }
}
