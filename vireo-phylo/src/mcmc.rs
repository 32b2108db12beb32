//! Metropolis-Hastings sampling over tree space.
//!
//! A small driver exercising the full reversible-state contract:
//! every generation brackets one proposal between `store_state` and
//! `accept_state`/`restore_state` on the likelihood, which cascades
//! to the tree. Operators are a uniform node-height move and the
//! narrow exchange (swap a node's child with its uncle).

use std::collections::HashMap;

use log::info;
use vireo_core::Result;

use crate::likelihood::TreeLikelihood;
use crate::state::Stateful;
use crate::tree::Tree;
use crate::tree_utils::newick;

/// Sampler configuration.
#[derive(Debug, Clone)]
pub struct McmcConfig {
    pub n_generations: usize,
    pub sample_every: usize,
    pub burnin: usize,
    pub seed: u64,
    pub proposal_weights: ProposalWeights,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_generations: 10000,
            sample_every: 100,
            burnin: 1000,
            seed: 42,
            proposal_weights: ProposalWeights::default(),
        }
    }
}

/// Relative weights for the proposal moves.
#[derive(Debug, Clone)]
pub struct ProposalWeights {
    pub node_height: f64,
    pub narrow_exchange: f64,
}

impl Default for ProposalWeights {
    fn default() -> Self {
        Self {
            node_height: 3.0,
            narrow_exchange: 1.0,
        }
    }
}

/// A single retained sample.
#[derive(Debug, Clone)]
pub struct McmcSample {
    pub generation: usize,
    pub log_likelihood: f64,
    pub root_height: f64,
    pub tree: String,
}

/// Results from a run.
#[derive(Debug, Clone)]
pub struct McmcResult {
    pub samples: Vec<McmcSample>,
    pub acceptance_rates: HashMap<String, f64>,
}

/// Simple xorshift64 PRNG.
struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in \[lo, hi\]
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    fn index(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

/// Run the sampler over the likelihood's tree under a flat prior.
pub fn run(likelihood: &mut TreeLikelihood, config: &McmcConfig) -> Result<McmcResult> {
    let mut rng = Xorshift64::new(config.seed);
    let mut current = likelihood.log_likelihood()?;

    let mut samples = Vec::new();
    let mut accept_counts: HashMap<String, (usize, usize)> = HashMap::new();
    let total_weight =
        config.proposal_weights.node_height + config.proposal_weights.narrow_exchange;

    info!(
        "mcmc over {}: {} generations, sampling every {}",
        likelihood.id(),
        config.n_generations,
        config.sample_every
    );

    for gen in 0..config.n_generations {
        likelihood.store_state();

        let r = rng.next_f64() * total_weight;
        let (name, valid) = if r < config.proposal_weights.node_height {
            ("node_height", propose_node_height(likelihood, &mut rng)?)
        } else {
            ("narrow_exchange", propose_narrow_exchange(likelihood, &mut rng)?)
        };

        let entry = accept_counts.entry(name.to_string()).or_insert((0, 0));
        entry.1 += 1;

        let accept = if !valid {
            false
        } else {
            let proposed = likelihood.log_likelihood()?;
            // Symmetric proposals, flat prior: the ratio is the
            // likelihood ratio alone.
            let log_alpha = proposed - current;
            if log_alpha >= 0.0 || rng.next_f64() < log_alpha.exp() {
                current = proposed;
                true
            } else {
                false
            }
        };

        if accept {
            entry.0 += 1;
            likelihood.accept_state();
        } else {
            likelihood.restore_state();
        }

        if gen >= config.burnin && (gen - config.burnin) % config.sample_every == 0 {
            samples.push(McmcSample {
                generation: gen,
                log_likelihood: current,
                root_height: likelihood.tree().node_height(likelihood.tree().root()),
                tree: newick(likelihood.tree()),
            });
        }
    }

    let acceptance_rates = accept_counts
        .into_iter()
        .map(|(name, (accepted, total))| {
            let rate = if total > 0 {
                accepted as f64 / total as f64
            } else {
                0.0
            };
            (name, rate)
        })
        .collect();

    Ok(McmcResult {
        samples,
        acceptance_rates,
    })
}

/// Redraw one internal node height uniformly between its children
/// and its parent; the root slides in a window above its children.
fn propose_node_height(likelihood: &mut TreeLikelihood, rng: &mut Xorshift64) -> Result<bool> {
    const ROOT_WINDOW: f64 = 0.5;

    let tree = likelihood.tree();
    let ext = tree.external_node_count();
    let node = ext + rng.index(tree.node_count() - ext);

    let lower = (0..tree.child_count(node))
        .map(|i| tree.node_height(tree.child(node, i)))
        .fold(f64::MIN, f64::max);
    let height = if tree.is_root(node) {
        let h = tree.node_height(node) + rng.uniform(-ROOT_WINDOW, ROOT_WINDOW);
        if h < lower {
            return Ok(false);
        }
        h
    } else {
        let upper = tree.node_height(Tree::parent(tree, node).unwrap());
        rng.uniform(lower, upper)
    };
    likelihood.tree_mut().set_node_height(node, height)?;
    Ok(true)
}

/// Swap a random child of a non-root internal node with that node's
/// sibling, when heights allow it.
fn propose_narrow_exchange(likelihood: &mut TreeLikelihood, rng: &mut Xorshift64) -> Result<bool> {
    let tree = likelihood.tree();
    let ext = tree.external_node_count();
    let internal = tree.node_count() - ext;
    if internal < 2 {
        return Ok(false);
    }

    // A non-root internal node and its parent.
    let node = ext + rng.index(internal);
    if tree.is_root(node) {
        return Ok(false);
    }
    let grand = Tree::parent(tree, node).unwrap();
    let uncle = match (0..tree.child_count(grand))
        .map(|i| tree.child(grand, i))
        .find(|&c| c != node)
    {
        Some(u) => u,
        None => return Ok(false),
    };
    if tree.node_height(uncle) >= tree.node_height(node) {
        return Ok(false);
    }
    let child = tree.child(node, rng.index(tree.child_count(node)));

    let tree = likelihood.tree_mut();
    tree.begin_edit()?;
    tree.remove_child(grand, uncle)?;
    tree.remove_child(node, child)?;
    tree.add_child(grand, child)?;
    tree.add_child(node, uncle)?;
    tree.end_edit()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{BinaryCoder, SitePatterns};
    use crate::rates::{SiteRates, StrictClock};
    use crate::subst::TwoState;
    use crate::tree_model::tests::four_taxon_tree;
    use crate::tree_utils::post_order_nodes;

    fn test_likelihood() -> TreeLikelihood {
        let patterns = SitePatterns::new(
            &BinaryCoder,
            &[
                ("A", b"00110101".as_slice()),
                ("B", b"00100101".as_slice()),
                ("C", b"11011010".as_slice()),
                ("D", b"11011000".as_slice()),
            ],
        )
        .unwrap();
        TreeLikelihood::new(
            "mcmc",
            four_taxon_tree(),
            patterns,
            Box::new(TwoState::symmetric()),
            SiteRates::invariant(),
            Box::new(StrictClock::new(1.0).unwrap()),
        )
        .unwrap()
    }

    fn short_config() -> McmcConfig {
        McmcConfig {
            n_generations: 300,
            sample_every: 10,
            burnin: 100,
            seed: 7,
            proposal_weights: ProposalWeights::default(),
        }
    }

    #[test]
    fn chain_produces_finite_samples() {
        let mut like = test_likelihood();
        let result = run(&mut like, &short_config()).unwrap();
        assert_eq!(result.samples.len(), 20);
        for s in &result.samples {
            assert!(s.log_likelihood.is_finite());
            assert!(s.root_height > 0.0);
            assert!(s.tree.ends_with(';'));
        }
        for (name, rate) in &result.acceptance_rates {
            assert!((0.0..=1.0).contains(rate), "{}: {}", name, rate);
        }
    }

    #[test]
    fn chain_is_deterministic_for_a_seed() {
        let mut a = test_likelihood();
        let mut b = test_likelihood();
        let ra = run(&mut a, &short_config()).unwrap();
        let rb = run(&mut b, &short_config()).unwrap();
        assert_eq!(ra.samples.len(), rb.samples.len());
        for (sa, sb) in ra.samples.iter().zip(&rb.samples) {
            assert_eq!(sa.log_likelihood, sb.log_likelihood);
            assert_eq!(sa.tree, sb.tree);
        }
    }

    #[test]
    fn tree_invariants_survive_the_chain() {
        let mut like = test_likelihood();
        run(&mut like, &short_config()).unwrap();

        let tree = like.tree();
        for node in post_order_nodes(tree) {
            if let Some(p) = Tree::parent(tree, node) {
                assert!(tree.node_height(p) >= tree.node_height(node));
            }
        }
        // The final cached value agrees with a full recompute.
        let cached = like.log_likelihood().unwrap();
        like.make_all_dirty();
        let fresh = like.log_likelihood().unwrap();
        assert!((cached - fresh).abs() < 1e-10);
    }

    #[test]
    fn no_snapshot_is_left_behind() {
        let mut like = test_likelihood();
        run(&mut like, &short_config()).unwrap();
        // Every generation closed its store/accept-or-restore
        // bracket, so a fresh cycle must not panic.
        like.store_state();
        like.restore_state();
    }
}
