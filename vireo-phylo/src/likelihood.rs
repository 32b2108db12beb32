//! Incremental tree likelihood: Felsenstein pruning with caching.
//!
//! [`TreeLikelihood`] owns the mutable tree plus the data and model
//! it is scored against, and keeps per-node partial vectors and
//! transition matrices between evaluations. Change notifications from
//! the tree are drained into per-node dirty flags, so a proposal that
//! moves one node height recomputes only that node's path to the
//! root. All per-node storage is double-buffered with current/stored
//! index arrays, making [`Stateful::store_state`] and
//! [`Stateful::restore_state`] index flips rather than data copies.
//!
//! Numerical underflow (a site likelihood of exactly zero) latches
//! per-node rescaling on for the lifetime of the object: partials are
//! divided by their per-pattern maximum and the logs of the scale
//! factors accumulate separately. A second underflow after rescaling
//! is a fatal [`VireoError::Numerical`].

use log::info;
use vireo_core::{Result, VireoError};

use crate::patterns::SitePatterns;
use crate::rates::{BranchRates, SiteRates};
use crate::state::Stateful;
use crate::subst::SubstitutionModel;
use crate::tree::{NodeId, Tree};
use crate::tree_model::{ChangeKind, TreeModel};
use crate::tree_utils::post_order_nodes;

pub struct TreeLikelihood {
    id: String,
    tree: TreeModel,
    patterns: SitePatterns,
    model: Box<dyn SubstitutionModel>,
    site_rates: SiteRates,
    branch_rates: Box<dyn BranchRates>,

    // tip_partials[tip] has pattern * state entries, fixed for the
    // lifetime of the object.
    tip_partials: Vec<Vec<f64>>,
    // Double-buffered per-node storage; tips carry empty partial and
    // scaler buffers. The index arrays say which buffer is current.
    partials: Vec<[Vec<f64>; 2]>,
    scalers: Vec<[Vec<f64>; 2]>,
    matrices: Vec<[Vec<f64>; 2]>,
    partials_index: Vec<usize>,
    matrix_index: Vec<usize>,
    stored_partials_index: Vec<usize>,
    stored_matrix_index: Vec<usize>,
    // A node's buffer is flipped at most once per snapshot cycle, so
    // repeated recomputes never clobber the stored buffer.
    flipped_partials: Vec<bool>,
    flipped_matrices: Vec<bool>,

    partial_dirty: Vec<bool>,
    matrix_dirty: Vec<bool>,
    stored_partial_dirty: Vec<bool>,
    stored_matrix_dirty: Vec<bool>,

    scaling: bool,
    likelihood_known: bool,
    log_likelihood: f64,
    stored_likelihood_known: bool,
    stored_log_likelihood: f64,
    snapshot_held: bool,

    // Number of node partial recomputations since construction.
    operations: u64,

    scratch_partials: Vec<f64>,
    scratch_scalers: Vec<f64>,
}

impl std::fmt::Debug for TreeLikelihood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeLikelihood")
            .field("id", &self.id)
            .field("patterns", &self.patterns.pattern_count())
            .field("states", &self.model.state_count())
            .field("categories", &self.site_rates.category_count())
            .field("rescaling", &self.scaling)
            .finish_non_exhaustive()
    }
}

impl TreeLikelihood {
    pub fn new(
        id: &str,
        tree: TreeModel,
        patterns: SitePatterns,
        model: Box<dyn SubstitutionModel>,
        site_rates: SiteRates,
        branch_rates: Box<dyn BranchRates>,
    ) -> Result<Self> {
        if model.state_count() != patterns.state_count() {
            return Err(VireoError::InvalidInput(format!(
                "likelihood {}: model has {} states but patterns have {}",
                id,
                model.state_count(),
                patterns.state_count()
            )));
        }
        if tree.external_node_count() < 2 {
            return Err(VireoError::InvalidInput(format!(
                "likelihood {}: tree needs at least two tips",
                id
            )));
        }

        let ns = model.state_count();
        let np = patterns.pattern_count();
        let nc = site_rates.category_count();
        let ext = tree.external_node_count();
        let node_count = tree.node_count();

        // Tip partials from the pattern states; a tip whose taxon is
        // absent from the alignment is fatal here, not at evaluation.
        let mut tip_partials = Vec::with_capacity(ext);
        for tip in 0..ext {
            let label = tree.taxon_id(tip).unwrap_or("");
            let taxon = patterns
                .taxon_index(label)
                .ok_or_else(|| VireoError::MissingTaxon(label.to_string()))?;
            let mut buf = vec![0.0; np * ns];
            for p in 0..np {
                let state = patterns.state(taxon, p);
                if state < ns {
                    buf[p * ns + state] = 1.0;
                } else {
                    // Missing data: uniform partial.
                    for s in 0..ns {
                        buf[p * ns + s] = 1.0;
                    }
                }
            }
            tip_partials.push(buf);
        }

        let partials = (0..node_count)
            .map(|n| {
                if n < ext {
                    [Vec::new(), Vec::new()]
                } else {
                    [vec![0.0; np * nc * ns], vec![0.0; np * nc * ns]]
                }
            })
            .collect();
        let scalers = (0..node_count)
            .map(|n| {
                if n < ext {
                    [Vec::new(), Vec::new()]
                } else {
                    [vec![0.0; np], vec![0.0; np]]
                }
            })
            .collect();
        let matrices = (0..node_count)
            .map(|_| [vec![0.0; nc * ns * ns], vec![0.0; nc * ns * ns]])
            .collect();

        info!(
            "likelihood {}: {} patterns, {} states, {} rate categories",
            id, np, ns, nc
        );

        Ok(Self {
            id: id.to_string(),
            tree,
            patterns,
            model,
            site_rates,
            branch_rates,
            tip_partials,
            partials,
            scalers,
            matrices,
            partials_index: vec![0; node_count],
            matrix_index: vec![0; node_count],
            stored_partials_index: vec![0; node_count],
            stored_matrix_index: vec![0; node_count],
            flipped_partials: vec![false; node_count],
            flipped_matrices: vec![false; node_count],
            partial_dirty: vec![true; node_count],
            matrix_dirty: vec![true; node_count],
            stored_partial_dirty: vec![true; node_count],
            stored_matrix_dirty: vec![true; node_count],
            scaling: false,
            likelihood_known: false,
            log_likelihood: 0.0,
            stored_likelihood_known: false,
            stored_log_likelihood: 0.0,
            snapshot_held: false,
            operations: 0,
            scratch_partials: vec![0.0; np * nc * ns],
            scratch_scalers: vec![0.0; np],
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tree(&self) -> &TreeModel {
        &self.tree
    }

    /// The tree, for mutation; changes are picked up at the next
    /// evaluation via the tree's change queue.
    pub fn tree_mut(&mut self) -> &mut TreeModel {
        &mut self.tree
    }

    pub fn patterns(&self) -> &SitePatterns {
        &self.patterns
    }

    /// True once underflow has latched per-node rescaling on.
    pub fn rescaling_active(&self) -> bool {
        self.scaling
    }

    /// Total node partial recomputations so far. A clean repeat
    /// evaluation leaves this unchanged.
    pub fn operation_count(&self) -> u64 {
        self.operations
    }

    /// The cached value from the last successful evaluation, if still
    /// valid.
    pub fn last_log_likelihood(&self) -> Option<f64> {
        if self.likelihood_known {
            Some(self.log_likelihood)
        } else {
            None
        }
    }

    /// Invalidate the branch below `node` and its path to the root.
    pub fn make_dirty(&mut self, node: NodeId) {
        if !self.tree.is_root(node) {
            self.matrix_dirty[node] = true;
        }
        for i in 0..self.tree.child_count(node) {
            let child = self.tree.child(node, i);
            self.matrix_dirty[child] = true;
        }
        let mut cur = Some(node);
        while let Some(n) = cur {
            self.partial_dirty[n] = true;
            cur = Tree::parent(&self.tree, n);
        }
        self.likelihood_known = false;
    }

    /// Invalidate everything.
    pub fn make_all_dirty(&mut self) {
        self.partial_dirty.iter_mut().for_each(|d| *d = true);
        self.matrix_dirty.iter_mut().for_each(|d| *d = true);
        self.likelihood_known = false;
    }

    /// Drain the tree's change queue into dirty flags.
    fn sync_tree_events(&mut self) {
        for event in self.tree.take_events() {
            match (event.node, event.kind) {
                (Some(node), ChangeKind::Height) => self.make_dirty(node),
                _ => self.make_all_dirty(),
            }
        }
    }

    /// Evaluate, recomputing only what the dirty flags require.
    ///
    /// An underflow on an unscaled evaluation turns rescaling on and
    /// recomputes everything once; a non-finite result after that is
    /// fatal. A failed evaluation leaves the dirty flags set.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.sync_tree_events();
        if self.likelihood_known {
            return Ok(self.log_likelihood);
        }

        let mut logl = self.calculate()?;

        if logl == f64::NEG_INFINITY && !self.scaling {
            info!(
                "likelihood {}: turning on partial rescaling to avoid numerical underflow",
                self.id
            );
            self.scaling = true;
            self.make_all_dirty();
            logl = self.calculate()?;
        }

        if !logl.is_finite() {
            return Err(VireoError::Numerical(format!(
                "likelihood {}: log-likelihood is {} even with rescaling enabled",
                self.id, logl
            )));
        }

        self.partial_dirty.iter_mut().for_each(|d| *d = false);
        self.matrix_dirty.iter_mut().for_each(|d| *d = false);
        self.log_likelihood = logl;
        self.likelihood_known = true;
        Ok(logl)
    }

    fn calculate(&mut self) -> Result<f64> {
        let order = post_order_nodes(&self.tree);
        let ns = self.model.state_count();
        let np = self.patterns.pattern_count();
        let nc = self.site_rates.category_count();
        let ext = self.tree.external_node_count();
        let root = self.tree.root();

        // Refresh transition matrices for dirty branches.
        for &node in &order {
            if node == root || !self.matrix_dirty[node] {
                continue;
            }
            let length = self.tree.branch_length(node);
            if length < 0.0 {
                return Err(VireoError::Structural(format!(
                    "likelihood {}: negative branch length {} below node {}",
                    self.id, length, node
                )));
            }
            let rate = self.branch_rates.branch_rate(&self.tree, node);
            if !self.flipped_matrices[node] {
                self.matrix_index[node] ^= 1;
                self.flipped_matrices[node] = true;
            }
            let buf = self.matrix_index[node];
            let mut m = std::mem::take(&mut self.matrices[node][buf]);
            for c in 0..nc {
                let distance = length * rate * self.site_rates.rate(c);
                self.model
                    .transition_probabilities(distance, &mut m[c * ns * ns..(c + 1) * ns * ns]);
            }
            self.matrices[node][buf] = m;
        }

        // Recompute dirty partials, children first.
        for &node in &order {
            if node < ext || !self.partial_dirty[node] {
                continue;
            }
            self.operations += 1;
            if !self.flipped_partials[node] {
                self.partials_index[node] ^= 1;
                self.flipped_partials[node] = true;
            }
            let buf = self.partials_index[node];
            let mut out = std::mem::take(&mut self.scratch_partials);
            let mut out_scalers = std::mem::take(&mut self.scratch_scalers);

            for p in 0..np {
                for c in 0..nc {
                    let base = (p * nc + c) * ns;
                    for s in 0..ns {
                        out[base + s] = 1.0;
                    }
                    for i in 0..self.tree.child_count(node) {
                        let child = self.tree.child(node, i);
                        let m = &self.matrices[child][self.matrix_index[child]]
                            [c * ns * ns..(c + 1) * ns * ns];
                        for s in 0..ns {
                            let mut sum = 0.0;
                            if child < ext {
                                let cp = &self.tip_partials[child][p * ns..(p + 1) * ns];
                                for t in 0..ns {
                                    sum += m[s * ns + t] * cp[t];
                                }
                            } else {
                                let cp = &self.partials[child][self.partials_index[child]]
                                    [base..base + ns];
                                for t in 0..ns {
                                    sum += m[s * ns + t] * cp[t];
                                }
                            }
                            out[base + s] *= sum;
                        }
                    }
                }
            }

            if self.scaling {
                for p in 0..np {
                    let mut max = 0.0_f64;
                    for c in 0..nc {
                        let base = (p * nc + c) * ns;
                        for s in 0..ns {
                            max = max.max(out[base + s]);
                        }
                    }
                    // Cumulative log scaler: this node's factor plus
                    // the children's accumulated factors.
                    let mut scaler = 0.0;
                    if max > 0.0 {
                        for c in 0..nc {
                            let base = (p * nc + c) * ns;
                            for s in 0..ns {
                                out[base + s] /= max;
                            }
                        }
                        scaler = max.ln();
                    }
                    for i in 0..self.tree.child_count(node) {
                        let child = self.tree.child(node, i);
                        if child >= ext {
                            scaler += self.scalers[child][self.partials_index[child]][p];
                        }
                    }
                    out_scalers[p] = scaler;
                }
            }

            self.scratch_partials = std::mem::replace(&mut self.partials[node][buf], out);
            self.scratch_scalers = std::mem::replace(&mut self.scalers[node][buf], out_scalers);
        }

        // Combine at the root with equilibrium frequencies and
        // category proportions, weighting each pattern by its count.
        let freqs = self.model.frequencies();
        let rp = &self.partials[root][self.partials_index[root]];
        let rs = &self.scalers[root][self.partials_index[root]];
        let mut total = 0.0;
        for p in 0..np {
            let mut site = 0.0;
            for c in 0..nc {
                let base = (p * nc + c) * ns;
                let mut sum = 0.0;
                for s in 0..ns {
                    sum += freqs[s] * rp[base + s];
                }
                site += self.site_rates.proportion(c) * sum;
            }
            let mut log_site = site.ln();
            if self.scaling {
                log_site += rs[p];
            }
            total += log_site * self.patterns.weight(p);
        }
        Ok(total)
    }
}

impl Stateful for TreeLikelihood {
    fn store_state(&mut self) {
        assert!(
            !self.snapshot_held,
            "likelihood {}: store_state while a snapshot is already held",
            self.id
        );
        // Capture any not-yet-drained tree changes as dirty flags so
        // the snapshot describes the tree state being stored.
        self.sync_tree_events();
        self.tree.store_state();
        self.stored_partials_index.copy_from_slice(&self.partials_index);
        self.stored_matrix_index.copy_from_slice(&self.matrix_index);
        self.stored_partial_dirty.copy_from_slice(&self.partial_dirty);
        self.stored_matrix_dirty.copy_from_slice(&self.matrix_dirty);
        self.stored_likelihood_known = self.likelihood_known;
        self.stored_log_likelihood = self.log_likelihood;
        self.flipped_partials.iter_mut().for_each(|f| *f = false);
        self.flipped_matrices.iter_mut().for_each(|f| *f = false);
        self.snapshot_held = true;
    }

    fn restore_state(&mut self) {
        assert!(
            self.snapshot_held,
            "likelihood {}: restore_state without a snapshot",
            self.id
        );
        self.tree.restore_state();
        self.partials_index.copy_from_slice(&self.stored_partials_index);
        self.matrix_index.copy_from_slice(&self.stored_matrix_index);
        self.partial_dirty.copy_from_slice(&self.stored_partial_dirty);
        self.matrix_dirty.copy_from_slice(&self.stored_matrix_dirty);
        self.likelihood_known = self.stored_likelihood_known;
        self.log_likelihood = self.stored_log_likelihood;
        self.flipped_partials.iter_mut().for_each(|f| *f = false);
        self.flipped_matrices.iter_mut().for_each(|f| *f = false);
        self.snapshot_held = false;
    }

    fn accept_state(&mut self) {
        self.tree.accept_state();
        self.flipped_partials.iter_mut().for_each(|f| *f = false);
        self.flipped_matrices.iter_mut().for_each(|f| *f = false);
        self.snapshot_held = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{BinaryCoder, NucleotideCoder, SitePatterns};
    use crate::rates::StrictClock;
    use crate::subst::{Jc69, TwoState};
    use crate::tree_model::tests::four_taxon_tree;
    use crate::tree_model::TreeBuilder;

    /// Direct summation over all internal (and missing-tip) state
    /// assignments; exponential in tree size, usable only for tiny
    /// trees.
    fn brute_force(
        tree: &TreeModel,
        patterns: &SitePatterns,
        model: &dyn SubstitutionModel,
        site_rates: &SiteRates,
        clock_rate: f64,
    ) -> f64 {
        let ns = model.state_count();
        let ext = tree.external_node_count();
        let root = tree.root();
        let tip_taxon: Vec<usize> = (0..ext)
            .map(|tip| patterns.taxon_index(tree.taxon_id(tip).unwrap()).unwrap())
            .collect();

        let mut total = 0.0;
        for p in 0..patterns.pattern_count() {
            // Free nodes: internals plus tips with missing data.
            let free: Vec<usize> = (0..tree.node_count())
                .filter(|&n| n >= ext || patterns.state(tip_taxon[n], p) >= ns)
                .collect();
            let mut site = 0.0;
            for c in 0..site_rates.category_count() {
                let mut cat_sum = 0.0;
                for assign in 0..ns.pow(free.len() as u32) {
                    let state_of = |node: usize| -> usize {
                        match free.iter().position(|&f| f == node) {
                            Some(k) => (assign / ns.pow(k as u32)) % ns,
                            None => patterns.state(tip_taxon[node], p),
                        }
                    };
                    let mut prob = model.frequencies()[state_of(root)];
                    for node in 0..tree.node_count() {
                        if node == root {
                            continue;
                        }
                        let d = tree.branch_length(node) * clock_rate * site_rates.rate(c);
                        let mut m = vec![0.0; ns * ns];
                        model.transition_probabilities(d, &mut m);
                        let parent = Tree::parent(tree, node).unwrap();
                        prob *= m[state_of(parent) * ns + state_of(node)];
                    }
                    cat_sum += prob;
                }
                site += site_rates.proportion(c) * cat_sum;
            }
            total += site.ln() * patterns.weight(p);
        }
        total
    }

    fn two_state_likelihood(columns: &[&[u8]; 4]) -> (TreeLikelihood, f64) {
        let tree = four_taxon_tree();
        let patterns = SitePatterns::new(
            &BinaryCoder,
            &[
                ("A", columns[0]),
                ("B", columns[1]),
                ("C", columns[2]),
                ("D", columns[3]),
            ],
        )
        .unwrap();
        let expected = brute_force(
            &tree,
            &patterns,
            &TwoState::symmetric(),
            &SiteRates::invariant(),
            1.0,
        );
        let like = TreeLikelihood::new(
            "test",
            tree,
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap();
        (like, expected)
    }

    #[test]
    fn two_state_matches_direct_summation() {
        let (mut like, expected) = two_state_likelihood(&[b"0", b"0", b"0", b"1"]);
        let logl = like.log_likelihood().unwrap();
        assert!((logl - expected).abs() < 1e-9, "{} vs {}", logl, expected);
        assert!(logl < 0.0);
    }

    #[test]
    fn jc69_matches_direct_summation() {
        let tree = four_taxon_tree();
        let patterns = SitePatterns::new(
            &NucleotideCoder,
            &[("A", b"ACGA"), ("B", b"ACGT"), ("C", b"GCGA"), ("D", b"GTGA")],
        )
        .unwrap();
        let expected = brute_force(&tree, &patterns, &Jc69::new(), &SiteRates::invariant(), 1.0);
        let mut like = TreeLikelihood::new(
            "jc",
            tree,
            patterns,
            Box::new(Jc69::new()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap();
        let logl = like.log_likelihood().unwrap();
        assert!((logl - expected).abs() < 1e-9, "{} vs {}", logl, expected);
    }

    #[test]
    fn gamma_categories_match_direct_summation() {
        let tree = four_taxon_tree();
        let patterns =
            SitePatterns::new(&NucleotideCoder, &[("A", b"AC"), ("B", b"AG"), ("C", b"TC"), ("D", b"TC")])
                .unwrap();
        let rates = SiteRates::gamma(0.5, 2).unwrap();
        let expected = brute_force(&tree, &patterns, &Jc69::new(), &rates, 0.7);
        let mut like = TreeLikelihood::new(
            "gamma",
            tree,
            patterns,
            Box::new(Jc69::new()),
            rates,
            Box::new(StrictClock::new(0.7).unwrap()),
        )
        .unwrap();
        let logl = like.log_likelihood().unwrap();
        assert!((logl - expected).abs() < 1e-9, "{} vs {}", logl, expected);
    }

    #[test]
    fn missing_data_marginalizes_over_states() {
        let tree = four_taxon_tree();
        let patterns = SitePatterns::new(
            &NucleotideCoder,
            &[("A", b"A"), ("B", b"N"), ("C", b"G"), ("D", b"G")],
        )
        .unwrap();
        let expected = brute_force(&tree, &patterns, &Jc69::new(), &SiteRates::invariant(), 1.0);
        let mut like = TreeLikelihood::new(
            "missing",
            tree,
            patterns,
            Box::new(Jc69::new()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap();
        let logl = like.log_likelihood().unwrap();
        assert!((logl - expected).abs() < 1e-9, "{} vs {}", logl, expected);
    }

    #[test]
    fn clean_repeat_recomputes_nothing() {
        let (mut like, _) = two_state_likelihood(&[b"01", b"00", b"10", b"11"]);
        let l1 = like.log_likelihood().unwrap();
        let ops = like.operation_count();
        assert_eq!(ops, 3); // three internal nodes
        let l2 = like.log_likelihood().unwrap();
        assert_eq!(l2, l1);
        assert_eq!(like.operation_count(), ops);
    }

    #[test]
    fn height_change_recomputes_only_the_path() {
        let (mut like, _) = two_state_likelihood(&[b"0", b"0", b"1", b"1"]);
        like.log_likelihood().unwrap();
        let ops = like.operation_count();

        // Moving node 4 dirties the partials of 4 and the root only.
        like.tree_mut().set_node_height(4, 0.5).unwrap();
        let incremental = like.log_likelihood().unwrap();
        assert_eq!(like.operation_count(), ops + 2);

        // The incremental result agrees with a full recompute.
        like.make_all_dirty();
        let fresh = like.log_likelihood().unwrap();
        assert!((incremental - fresh).abs() < 1e-10);
    }

    #[test]
    fn store_restore_height_round_trip() {
        let (mut like, _) = two_state_likelihood(&[b"0", b"1", b"0", b"1"]);
        let l0 = like.log_likelihood().unwrap();

        like.store_state();
        like.tree_mut().set_node_height(5, 0.25).unwrap();
        let l1 = like.log_likelihood().unwrap();
        assert!(l1 != l0);
        like.restore_state();

        // Restore flips back to the stored buffers; the cached value
        // is valid again and nothing recomputes.
        let ops = like.operation_count();
        let l2 = like.log_likelihood().unwrap();
        assert_eq!(l2, l0);
        assert_eq!(like.operation_count(), ops);
    }

    #[test]
    fn store_restore_topology_round_trip() {
        let (mut like, _) = two_state_likelihood(&[b"0", b"0", b"1", b"1"]);
        let l0 = like.log_likelihood().unwrap();

        like.store_state();
        // Exchange B and C between the two cherries.
        let tree = like.tree_mut();
        tree.begin_edit().unwrap();
        tree.remove_child(4, 1).unwrap();
        tree.remove_child(5, 2).unwrap();
        tree.add_child(4, 2).unwrap();
        tree.add_child(5, 1).unwrap();
        tree.end_edit().unwrap();
        let l1 = like.log_likelihood().unwrap();
        assert!((l1 - l0).abs() > 1e-6, "exchange should change the likelihood");
        like.restore_state();

        let l2 = like.log_likelihood().unwrap();
        assert_eq!(l2, l0);
    }

    #[test]
    fn accept_keeps_the_new_state() {
        let (mut like, _) = two_state_likelihood(&[b"0", b"1", b"1", b"0"]);
        like.log_likelihood().unwrap();
        like.store_state();
        like.tree_mut().set_node_height(4, 0.5).unwrap();
        let l1 = like.log_likelihood().unwrap();
        like.accept_state();
        assert_eq!(like.log_likelihood().unwrap(), l1);
        // A fresh snapshot cycle works after accept.
        like.store_state();
        like.restore_state();
    }

    #[test]
    fn repeated_store_restore_cycles_agree() {
        let (mut like, _) = two_state_likelihood(&[b"01", b"01", b"10", b"10"]);
        let l0 = like.log_likelihood().unwrap();
        for step in 0..5 {
            like.store_state();
            like.tree_mut()
                .set_node_height(4, 0.2 + 0.1 * step as f64)
                .unwrap();
            like.log_likelihood().unwrap();
            like.restore_state();
            assert_eq!(like.log_likelihood().unwrap(), l0);
        }
    }

    #[test]
    fn missing_taxon_is_fatal_at_construction() {
        let tree = four_taxon_tree();
        let patterns =
            SitePatterns::new(&BinaryCoder, &[("A", b"0"), ("B", b"0"), ("C", b"1")]).unwrap();
        let err = TreeLikelihood::new(
            "bad",
            tree,
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap_err();
        assert!(matches!(err, VireoError::MissingTaxon(ref t) if t == "D"));
    }

    #[test]
    fn state_count_mismatch_rejected() {
        let tree = four_taxon_tree();
        let patterns = SitePatterns::new(
            &NucleotideCoder,
            &[("A", b"A"), ("B", b"C"), ("C", b"G"), ("D", b"T")],
        )
        .unwrap();
        let err = TreeLikelihood::new(
            "mismatch",
            tree,
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap_err();
        assert!(matches!(err, VireoError::InvalidInput(_)));
    }

    #[test]
    fn underflow_latches_rescaling_and_recovers() {
        // 40 cherries, each with conflicting tip states across a
        // branch of length 1e-10. The per-pattern likelihood is
        // roughly (1e-10)^40, far below the double range, so the
        // first evaluation underflows to -inf and rescaling rescues
        // it.
        let eps = 0.5 * (1.0 - (-2.0 * 1e-10_f64).exp());
        let mut b = TreeBuilder::new("deep");
        let mut level: Vec<_> = (0..40)
            .map(|i| {
                let x = b.tip(&format!("x{}", i), 0.0);
                let y = b.tip(&format!("y{}", i), 0.0);
                b.join(&[x, y], 1e-10)
            })
            .collect();
        let mut h = 1e-10;
        while level.len() > 1 {
            h += 1e-10;
            let mut next = Vec::new();
            for pair in level.chunks(2) {
                if pair.len() == 2 {
                    next.push(b.join(&[pair[0], pair[1]], h));
                } else {
                    next.push(pair[0]);
                }
            }
            level = next;
        }
        let tree = b.build().unwrap();

        let sequences: Vec<(String, &[u8])> = (0..40)
            .flat_map(|i| {
                [
                    (format!("x{}", i), b"0".as_slice()),
                    (format!("y{}", i), b"1".as_slice()),
                ]
            })
            .collect();
        let refs: Vec<(&str, &[u8])> = sequences.iter().map(|(t, s)| (t.as_str(), *s)).collect();
        let patterns = SitePatterns::new(&BinaryCoder, &refs).unwrap();

        let mut like = TreeLikelihood::new(
            "deep",
            tree,
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap();
        assert!(!like.rescaling_active());
        let logl = like.log_likelihood().unwrap();
        assert!(like.rescaling_active());
        assert!(logl.is_finite());
        // Each cherry contributes ln((1-eps) * eps); all other
        // branches are near-identity.
        let expected = 40.0 * ((1.0 - eps) * eps).ln();
        assert!((logl - expected).abs() < 1e-6, "{} vs {}", logl, expected);
        // The latch stays on and the value is stable.
        assert_eq!(like.log_likelihood().unwrap(), logl);
        assert!(like.rescaling_active());
    }

    #[test]
    fn impossible_data_is_fatal_even_with_rescaling() {
        // A zero-length branch between conflicting definite states
        // gives an identity transition matrix and a site likelihood
        // of exactly zero; no amount of rescaling can recover it.
        let mut b = TreeBuilder::new("flat");
        let a = b.tip("A", 0.0);
        let c = b.tip("B", 0.0);
        let ab = b.join(&[a, c], 0.0);
        let d = b.tip("C", 0.0);
        b.join(&[ab, d], 1.0);
        let tree = b.build().unwrap();
        let patterns =
            SitePatterns::new(&BinaryCoder, &[("A", b"0"), ("B", b"1"), ("C", b"0")]).unwrap();
        let mut like = TreeLikelihood::new(
            "flat",
            tree,
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap();
        let err = like.log_likelihood().unwrap_err();
        assert!(matches!(err, VireoError::Numerical(_)));
        assert!(like.rescaling_active());
        // The failure leaves the dirty flags set; a retry fails the
        // same way instead of returning a stale cache.
        assert!(like.log_likelihood().is_err());
        assert!(like.last_log_likelihood().is_none());
    }

    #[test]
    fn debug_output_names_the_instance() {
        let (like, _) = two_state_likelihood(&[b"0", b"0", b"1", b"1"]);
        let s = format!("{:?}", like);
        assert!(s.contains("TreeLikelihood"));
        assert!(s.contains("\"test\""));
    }

    #[test]
    #[should_panic(expected = "snapshot is already held")]
    fn double_store_faults() {
        let (mut like, _) = two_state_likelihood(&[b"0", b"0", b"1", b"1"]);
        like.store_state();
        like.store_state();
    }
}
