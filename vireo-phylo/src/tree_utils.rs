//! Pure traversal and query algorithms over any [`Tree`].
//!
//! None of these functions mutate the tree. Precondition violations
//! (a node id that does not belong to the tree, a non-monotone height
//! assumption in the height-walk ancestor search) are programming
//! errors and fail fast with a panic rather than corrupting results.

use std::collections::{BTreeSet, HashSet};

use crate::rates::BranchRates;
use crate::tree::{NodeId, Tree};

/// Number of leaves in the subtree rooted at `node`.
pub fn leaf_count(tree: &dyn Tree, node: NodeId) -> usize {
    let n = tree.child_count(node);
    if n == 0 {
        return 1;
    }
    (0..n).map(|i| leaf_count(tree, tree.child(node, i))).sum()
}

/// Sum of branch lengths in the subtree rooted at `node`, including
/// the branch above `node` unless it is the root.
pub fn tree_length(tree: &dyn Tree, node: NodeId) -> f64 {
    let n = tree.child_count(node);
    let mut length = if tree.is_root(node) {
        0.0
    } else {
        tree.branch_length(node)
    };
    for i in 0..n {
        length += tree_length(tree, tree.child(node, i));
    }
    length
}

/// Minimum node height in the subtree rooted at `node`.
pub fn min_node_height(tree: &dyn Tree, node: NodeId) -> f64 {
    let n = tree.child_count(node);
    if n == 0 {
        return tree.node_height(node);
    }
    (0..n)
        .map(|i| min_node_height(tree, tree.child(node, i)))
        .fold(f64::MAX, f64::min)
}

/// True only if all tips sit at height 0.0.
pub fn is_ultrametric(tree: &dyn Tree) -> bool {
    (0..tree.external_node_count()).all(|i| tree.node_height(i) == 0.0)
}

/// True only if every internal node has at most 2 children.
pub fn is_binary(tree: &dyn Tree) -> bool {
    (0..tree.node_count()).all(|n| tree.child_count(n) <= 2)
}

/// Common ancestor of two nodes found by walking upward from
/// whichever node is currently lower.
///
/// Precondition: heights are monotonically non-decreasing toward the
/// root (always true for a valid tree) and both nodes belong to the
/// tree; a violation panics once the walk runs past the root.
pub fn common_ancestor(tree: &dyn Tree, mut a: NodeId, mut b: NodeId) -> NodeId {
    while a != b {
        if tree.node_height(a) < tree.node_height(b) {
            a = tree
                .parent(a)
                .unwrap_or_else(|| panic!("common_ancestor: walk past root from node {}", a));
        } else {
            b = tree
                .parent(b)
                .unwrap_or_else(|| panic!("common_ancestor: walk past root from node {}", b));
        }
    }
    a
}

/// Common ancestor of a group of nodes, as a fold of the pairwise walk.
pub fn common_ancestor_of(tree: &dyn Tree, nodes: &[NodeId]) -> NodeId {
    assert!(!nodes.is_empty(), "common_ancestor_of: no nodes given");
    let mut cur = nodes[0];
    for &n in &nodes[1..] {
        cur = common_ancestor(tree, cur, n);
    }
    cur
}

/// Most recent common ancestor of a set of tip labels.
///
/// A single post-order pass counting, per node, how many members of
/// `leaf_set` lie below it; the first node whose count reaches the
/// set's cardinality is the MRCA. Returns `None` if fewer than the
/// full set is present in the tree. Panics on an empty set.
pub fn mrca(tree: &dyn Tree, leaf_set: &HashSet<&str>) -> Option<NodeId> {
    assert!(!leaf_set.is_empty(), "mrca: no leaf nodes selected");
    let mut found = None;
    mrca_recurse(tree, tree.root(), leaf_set, leaf_set.len(), &mut found);
    found
}

fn mrca_recurse(
    tree: &dyn Tree,
    node: NodeId,
    leaf_set: &HashSet<&str>,
    cardinality: usize,
    found: &mut Option<NodeId>,
) -> usize {
    if tree.is_external(node) {
        let hit = tree
            .taxon_id(node)
            .map(|id| leaf_set.contains(id))
            .unwrap_or(false);
        if hit && cardinality == 1 {
            *found = Some(node);
        }
        return hit as usize;
    }
    let mut matches = 0;
    for i in 0..tree.child_count(node) {
        matches += mrca_recurse(tree, tree.child(node, i), leaf_set, cardinality, found);
        if found.is_some() {
            return matches;
        }
    }
    if matches == cardinality {
        *found = Some(node);
    }
    matches
}

/// Monophyly test: true iff some node subtends exactly the tips in
/// `leaf_set` and no others.
pub fn is_monophyletic(tree: &dyn Tree, leaf_set: &HashSet<&str>) -> bool {
    is_monophyletic_ignoring(tree, leaf_set, &HashSet::new())
}

/// Monophyly test with an `ignore` set excluded from the assessment.
///
/// A singleton set and the full tip set are trivially monophyletic;
/// short-circuits on the first node reaching the cardinality. Panics
/// on an empty set.
pub fn is_monophyletic_ignoring(
    tree: &dyn Tree,
    leaf_set: &HashSet<&str>,
    ignore: &HashSet<&str>,
) -> bool {
    assert!(!leaf_set.is_empty(), "is_monophyletic: no leaf nodes selected");
    if leaf_set.len() == 1 || leaf_set.len() == tree.external_node_count() {
        return true;
    }
    let mut mono = false;
    mono_recurse(
        tree,
        tree.root(),
        leaf_set,
        ignore,
        leaf_set.len(),
        &mut mono,
    );
    mono
}

/// Returns (matches, counted leaves, done) for the subtree at `node`.
fn mono_recurse(
    tree: &dyn Tree,
    node: NodeId,
    leaf_set: &HashSet<&str>,
    ignore: &HashSet<&str>,
    cardinality: usize,
    mono: &mut bool,
) -> (usize, usize, bool) {
    if tree.is_external(node) {
        let id = tree.taxon_id(node).unwrap_or("");
        let m = leaf_set.contains(id) as usize;
        let l = (!ignore.contains(id)) as usize;
        return (m, l, false);
    }
    let mut mc = 0;
    let mut lc = 0;
    for i in 0..tree.child_count(node) {
        let (m, l, done) = mono_recurse(tree, tree.child(node, i), leaf_set, ignore, cardinality, mono);
        mc += m;
        lc += l;
        if done {
            return (mc, lc, true);
        }
    }
    if mc == lc && lc == cardinality {
        *mono = true;
        return (mc, lc, true);
    }
    (mc, lc, false)
}

/// Tip labels descending from `node`.
pub fn descendant_leaves(tree: &dyn Tree, node: NodeId) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    collect_leaves(tree, node, &mut set);
    set
}

fn collect_leaves(tree: &dyn Tree, node: NodeId, set: &mut BTreeSet<String>) {
    if tree.is_external(node) {
        if let Some(id) = tree.taxon_id(node) {
            set.insert(id.to_string());
        }
        return;
    }
    for i in 0..tree.child_count(node) {
        collect_leaves(tree, tree.child(node, i), set);
    }
}

/// The set of clades in the tree: one tip-label set per internal
/// non-root node.
pub fn clades(tree: &dyn Tree) -> HashSet<BTreeSet<String>> {
    let mut out = HashSet::new();
    for n in 0..tree.node_count() {
        if !tree.is_external(n) && !tree.is_root(n) {
            out.insert(descendant_leaves(tree, n));
        }
    }
    out
}

/// Post-order node listing: children before parents, left to right.
pub fn post_order_nodes(tree: &dyn Tree) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(tree.node_count());
    post_order_recurse(tree, tree.root(), &mut out);
    out
}

fn post_order_recurse(tree: &dyn Tree, node: NodeId, out: &mut Vec<NodeId>) {
    for i in 0..tree.child_count(node) {
        post_order_recurse(tree, tree.child(node, i), out);
    }
    out.push(node);
}

/// What to write for each branch in a Newick serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchLengthMode {
    /// Topology only.
    None,
    /// Height difference in time units.
    Time,
    /// Height difference scaled by a per-branch rate (expected
    /// substitutions per site).
    Substitutions,
}

/// Where a trait annotation attaches in Newick output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitIntent {
    Node,
    Branch,
}

/// Pluggable source of per-node or per-branch annotations rendered as
/// a `[&key=value,...]` comment.
pub trait TraitProvider {
    fn intent(&self) -> TraitIntent;
    fn name(&self) -> &str;
    /// The rendered value for `node`, or `None` to omit it.
    fn value(&self, tree: &dyn Tree, node: NodeId) -> Option<String>;
}

/// Trait provider backed by the tree's own node attribute map.
pub struct AttributeTraits {
    key: String,
    intent: TraitIntent,
}

impl AttributeTraits {
    pub fn new(key: &str, intent: TraitIntent) -> Self {
        Self {
            key: key.to_string(),
            intent,
        }
    }
}

impl TraitProvider for AttributeTraits {
    fn intent(&self) -> TraitIntent {
        self.intent
    }

    fn name(&self) -> &str {
        &self.key
    }

    fn value(&self, tree: &dyn Tree, node: NodeId) -> Option<String> {
        tree.node_attribute(node, &self.key).map(|v| v.to_string())
    }
}

/// Newick serialization with branch lengths as time.
pub fn newick(tree: &dyn Tree) -> String {
    let mut buf = String::new();
    write_newick(tree, tree.root(), BranchLengthMode::Time, None, &[], &mut buf);
    buf.push(';');
    buf
}

/// Newick serialization of topology only.
pub fn newick_no_lengths(tree: &dyn Tree) -> String {
    let mut buf = String::new();
    write_newick(tree, tree.root(), BranchLengthMode::None, None, &[], &mut buf);
    buf.push(';');
    buf
}

/// Newick serialization with branch lengths in expected substitutions,
/// scaling each branch time by the supplied rate function.
pub fn newick_with_rates(tree: &dyn Tree, rates: &dyn BranchRates) -> String {
    let mut buf = String::new();
    write_newick(
        tree,
        tree.root(),
        BranchLengthMode::Substitutions,
        Some(rates),
        &[],
        &mut buf,
    );
    buf.push(';');
    buf
}

/// Newick serialization with trait annotations.
pub fn newick_annotated(tree: &dyn Tree, providers: &[&dyn TraitProvider]) -> String {
    let mut buf = String::new();
    write_newick(
        tree,
        tree.root(),
        BranchLengthMode::Time,
        None,
        providers,
        &mut buf,
    );
    buf.push(';');
    buf
}

/// Recursive Newick writer underlying the convenience functions.
///
/// `rates` must be supplied when `mode` is
/// [`BranchLengthMode::Substitutions`]; this is a caller error
/// otherwise and panics.
pub fn write_newick(
    tree: &dyn Tree,
    node: NodeId,
    mode: BranchLengthMode,
    rates: Option<&dyn BranchRates>,
    providers: &[&dyn TraitProvider],
    buf: &mut String,
) {
    if tree.is_external(node) {
        buf.push_str(tree.taxon_id(node).unwrap_or(""));
    } else {
        buf.push('(');
        for i in 0..tree.child_count(node) {
            if i > 0 {
                buf.push(',');
            }
            write_newick(tree, tree.child(node, i), mode, rates, providers, buf);
        }
        buf.push(')');
    }

    write_traits(tree, node, providers, TraitIntent::Node, buf);

    if !tree.is_root(node) && mode != BranchLengthMode::None {
        buf.push(':');
        write_traits(tree, node, providers, TraitIntent::Branch, buf);
        let mut length = tree.branch_length(node);
        if mode == BranchLengthMode::Substitutions {
            let rates = rates.expect("substitution branch lengths need a BranchRates");
            length *= rates.branch_rate(tree, node);
        }
        buf.push_str(&format_length(length));
    }
}

fn write_traits(
    tree: &dyn Tree,
    node: NodeId,
    providers: &[&dyn TraitProvider],
    intent: TraitIntent,
    buf: &mut String,
) {
    let mut open = false;
    for p in providers {
        if p.intent() != intent {
            continue;
        }
        if let Some(value) = p.value(tree, node) {
            buf.push_str(if open { "," } else { "[&" });
            open = true;
            buf.push_str(p.name());
            buf.push('=');
            buf.push_str(&value);
        }
    }
    if open {
        buf.push(']');
    }
}

/// Fixed precision with trailing zeros stripped.
fn format_length(len: f64) -> String {
    let s = format!("{:.10}", len);
    let s = s.trim_end_matches('0');
    s.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::StrictClock;
    use crate::tree::AttrValue;
    use crate::tree_model::tests::four_taxon_tree;
    use crate::tree_model::TreeBuilder;

    fn set(names: &[&'static str]) -> HashSet<&'static str> {
        names.iter().copied().collect()
    }

    #[test]
    fn leaf_counts() {
        let t = four_taxon_tree();
        assert_eq!(leaf_count(&t, t.root()), 4);
        assert_eq!(leaf_count(&t, 4), 2);
        assert_eq!(leaf_count(&t, 0), 1);
    }

    #[test]
    fn tree_length_sums_branches() {
        let t = four_taxon_tree();
        // Four tip branches of 1.0 plus two internal branches of 1.0.
        assert!((tree_length(&t, t.root()) - 6.0).abs() < 1e-12);
        // Subtree (A,B): two tip branches plus its own branch.
        assert!((tree_length(&t, 4) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn min_height_and_shape_tests() {
        let t = four_taxon_tree();
        assert_eq!(min_node_height(&t, t.root()), 0.0);
        assert!(is_ultrametric(&t));
        assert!(is_binary(&t));
    }

    #[test]
    fn non_ultrametric_detected() {
        let mut b = TreeBuilder::new("serial");
        let a = b.tip("A", 0.0);
        let c = b.tip("B", 0.5);
        b.join(&[a, c], 1.0);
        let t = b.build().unwrap();
        assert!(!is_ultrametric(&t));
    }

    #[test]
    fn common_ancestor_by_height_walk() {
        let t = four_taxon_tree();
        assert_eq!(common_ancestor(&t, 0, 1), 4);
        assert_eq!(common_ancestor(&t, 0, 2), 6);
        assert_eq!(common_ancestor(&t, 0, 4), 4);
        assert_eq!(common_ancestor(&t, 3, 3), 3);
        assert_eq!(common_ancestor_of(&t, &[0, 1, 2]), 6);
    }

    #[test]
    fn mrca_by_leaf_set() {
        let t = four_taxon_tree();
        assert_eq!(mrca(&t, &set(&["A", "B"])), Some(4));
        assert_eq!(mrca(&t, &set(&["C", "D"])), Some(5));
        assert_eq!(mrca(&t, &set(&["A", "C"])), Some(6));
        assert_eq!(mrca(&t, &set(&["A"])), Some(0));
        assert_eq!(mrca(&t, &set(&["A", "Z"])), None);
    }

    #[test]
    fn monophyly_boundary_cases() {
        let t = four_taxon_tree();
        // Singleton and full tip set are trivially monophyletic.
        assert!(is_monophyletic(&t, &set(&["A"])));
        assert!(is_monophyletic(&t, &set(&["A", "B", "C", "D"])));
        // True clades.
        assert!(is_monophyletic(&t, &set(&["A", "B"])));
        assert!(is_monophyletic(&t, &set(&["C", "D"])));
        // Non-clades.
        assert!(!is_monophyletic(&t, &set(&["A", "C"])));
        assert!(!is_monophyletic(&t, &set(&["A", "B", "C"])));
    }

    #[test]
    fn monophyly_in_asymmetric_tree() {
        // (((A,B),C),D): {A,B} is a clade, {B,C} spans A's ancestor.
        let mut b = TreeBuilder::new("ladder");
        let a = b.tip("A", 0.0);
        let bb = b.tip("B", 0.0);
        let c = b.tip("C", 0.0);
        let d = b.tip("D", 0.0);
        let ab = b.join(&[a, bb], 1.0);
        let abc = b.join(&[ab, c], 2.0);
        b.join(&[abc, d], 3.0);
        let t = b.build().unwrap();
        assert!(is_monophyletic(&t, &set(&["A", "B"])));
        assert!(is_monophyletic(&t, &set(&["A", "B", "C"])));
        assert!(!is_monophyletic(&t, &set(&["B", "C"])));
        // Ignoring A, {B,C} subtends everything else under their MRCA.
        assert!(is_monophyletic_ignoring(&t, &set(&["B", "C"]), &set(&["A"])));
    }

    #[test]
    #[should_panic(expected = "no leaf nodes selected")]
    fn empty_monophyly_set_faults() {
        let t = four_taxon_tree();
        is_monophyletic(&t, &HashSet::new());
    }

    #[test]
    fn clade_sets() {
        let t = four_taxon_tree();
        let c = clades(&t);
        assert_eq!(c.len(), 2);
        let ab: BTreeSet<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let cd: BTreeSet<String> = ["C", "D"].iter().map(|s| s.to_string()).collect();
        assert!(c.contains(&ab));
        assert!(c.contains(&cd));
    }

    #[test]
    fn post_order_children_before_parents() {
        let t = four_taxon_tree();
        let order = post_order_nodes(&t);
        assert_eq!(order, vec![0, 1, 4, 2, 3, 5, 6]);
    }

    #[test]
    fn newick_time_lengths() {
        let t = four_taxon_tree();
        assert_eq!(newick(&t), "((A:1,B:1):1,(C:1,D:1):1);");
    }

    #[test]
    fn newick_topology_only() {
        let t = four_taxon_tree();
        assert_eq!(newick_no_lengths(&t), "((A,B),(C,D));");
    }

    #[test]
    fn newick_substitution_lengths() {
        let t = four_taxon_tree();
        let clock = StrictClock::new(2.0).unwrap();
        assert_eq!(newick_with_rates(&t, &clock), "((A:2,B:2):2,(C:2,D:2):2);");
    }

    #[test]
    fn newick_with_node_annotations() {
        let mut t = four_taxon_tree();
        t.set_node_attribute(4, "posterior", AttrValue::Real(0.95));
        let traits = AttributeTraits::new("posterior", TraitIntent::Node);
        let out = newick_annotated(&t, &[&traits]);
        assert_eq!(out, "((A:1,B:1)[&posterior=0.95]:1,(C:1,D:1):1);");
    }

    #[test]
    fn newick_with_branch_annotations() {
        let mut t = four_taxon_tree();
        t.set_node_attribute(0, "rate", AttrValue::Real(1.5));
        let traits = AttributeTraits::new("rate", TraitIntent::Branch);
        let out = newick_annotated(&t, &[&traits]);
        assert_eq!(out, "((A:[&rate=1.5]1,B:1):1,(C:1,D:1):1);");
    }

    #[test]
    fn format_length_strips_zeros() {
        assert_eq!(format_length(1.0), "1");
        assert_eq!(format_length(0.25), "0.25");
        assert_eq!(format_length(0.1000000001), "0.1000000001");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::tree_model::{TreeBuilder, TreeModel};
    use proptest::prelude::*;

    /// Caterpillar tree over n tips with unit-spaced internal heights.
    fn caterpillar(n: usize) -> TreeModel {
        let mut b = TreeBuilder::new("cat");
        let mut tips = Vec::new();
        for i in 0..n {
            tips.push(b.tip(&format!("T{}", i), 0.0));
        }
        let mut spine = b.join(&[tips[0], tips[1]], 1.0);
        for (k, &tip) in tips.iter().enumerate().skip(2) {
            spine = b.join(&[spine, tip], k as f64);
        }
        b.build().unwrap()
    }

    proptest! {
        #[test]
        fn leaf_count_matches_external_count(n in 2usize..12) {
            let t = caterpillar(n);
            prop_assert_eq!(leaf_count(&t, t.root()), t.external_node_count());
        }

        #[test]
        fn post_order_visits_each_node_once(n in 2usize..12) {
            let t = caterpillar(n);
            let mut order = post_order_nodes(&t);
            prop_assert_eq!(order.len(), t.node_count());
            order.sort_unstable();
            order.dedup();
            prop_assert_eq!(order.len(), t.node_count());
        }

        #[test]
        fn heights_monotone_toward_root(n in 2usize..12) {
            let t = caterpillar(n);
            for node in 0..t.node_count() {
                if let Some(p) = crate::tree::Tree::parent(&t, node) {
                    prop_assert!(crate::tree::Tree::node_height(&t, p)
                        >= crate::tree::Tree::node_height(&t, node));
                }
            }
        }
    }
}
