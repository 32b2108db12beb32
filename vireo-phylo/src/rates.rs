//! Branch-rate and site-rate models.
//!
//! A [`BranchRates`] maps each branch of a tree to a molecular clock
//! rate; a [`SiteRates`] splits sites across a small set of rate
//! categories. Both feed the likelihood engine, which multiplies
//! branch time by branch rate and site category rate to get the
//! evolutionary distance for each transition matrix.

use std::f64::consts::PI;

use log::info;
use vireo_core::{Result, VireoError};

use crate::parameter::{Bounds, Parameter};
use crate::state::Stateful;
use crate::tree::{NodeId, Tree};

// ── Gamma special functions ───────────────────────────────────────────────

/// Natural log of the gamma function, Lanczos approximation (g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula: Γ(x) = π / (sin(πx) · Γ(1-x))
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        log_pi_over_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5; // g + 0.5
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x).
///
/// Series expansion for x < a + 1, continued fraction (modified
/// Lentz) for the upper tail otherwise.
fn gammainc(a: f64, x: f64) -> f64 {
    debug_assert!(a > 0.0 && x >= 0.0);
    if x == 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gammainc_series(a, x)
    } else {
        1.0 - gammainc_cf(a, x)
    }
}

fn gammainc_series(a: f64, x: f64) -> f64 {
    let max_iter = 200;
    let eps = 1e-12;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut sum = 1.0 / a;
    let mut term = 1.0 / a;

    for n in 1..=max_iter {
        term *= x / (a + n as f64);
        sum += term;
        if term.abs() < sum.abs() * eps {
            break;
        }
    }
    sum * ln_prefix.exp()
}

fn gammainc_cf(a: f64, x: f64) -> f64 {
    let max_iter = 200;
    let eps = 1e-12;
    let tiny = 1e-30_f64;
    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / tiny;
    let mut d = 1.0 / b;
    let mut h = d;

    for i in 1..=max_iter {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < tiny {
            d = tiny;
        }
        c = b + an / c;
        if c.abs() < tiny {
            c = tiny;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < eps {
            break;
        }
    }
    h * ln_prefix.exp()
}

/// Quantile of the gamma distribution with the given shape and scale,
/// by bisection on P(shape, x/scale).
fn gamma_quantile(shape: f64, scale: f64, p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);
    // Bracket the root: grow the upper bound until P exceeds p.
    let mut hi = shape * scale;
    while gammainc(shape, hi / scale) < p {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if gammainc(shape, mid / scale) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-14 * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}

// ── Rate distributions ────────────────────────────────────────────────────

/// A positive distribution queried only through its quantile function.
pub trait RateDistribution {
    fn quantile(&self, p: f64) -> f64;
}

/// Exponential distribution with the given mean.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    mean: f64,
}

impl Exponential {
    pub fn new(mean: f64) -> Result<Self> {
        if mean <= 0.0 {
            return Err(VireoError::InvalidInput(format!(
                "exponential mean must be positive, got {}",
                mean
            )));
        }
        Ok(Self { mean })
    }
}

impl RateDistribution for Exponential {
    fn quantile(&self, p: f64) -> f64 {
        -self.mean * (1.0 - p).ln()
    }
}

/// Gamma distribution with the given shape and scale.
#[derive(Debug, Clone, Copy)]
pub struct Gamma {
    shape: f64,
    scale: f64,
}

impl Gamma {
    pub fn new(shape: f64, scale: f64) -> Result<Self> {
        if shape <= 0.0 || scale <= 0.0 {
            return Err(VireoError::InvalidInput(format!(
                "gamma shape and scale must be positive, got shape {} scale {}",
                shape, scale
            )));
        }
        Ok(Self { shape, scale })
    }
}

impl RateDistribution for Gamma {
    fn quantile(&self, p: f64) -> f64 {
        gamma_quantile(self.shape, self.scale, p)
    }
}

// ── Branch rates ──────────────────────────────────────────────────────────

/// Per-branch molecular clock rates.
///
/// The branch is identified by its lower node; the root has no branch
/// and must not be queried.
pub trait BranchRates {
    fn branch_rate(&self, tree: &dyn Tree, node: NodeId) -> f64;
}

/// A single rate shared by every branch.
#[derive(Debug, Clone, Copy)]
pub struct StrictClock {
    rate: f64,
}

impl StrictClock {
    pub fn new(rate: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(VireoError::InvalidInput(format!(
                "clock rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self { rate })
    }
}

impl BranchRates for StrictClock {
    fn branch_rate(&self, _tree: &dyn Tree, _node: NodeId) -> f64 {
        self.rate
    }
}

/// Relaxed clock over a fixed grid of rate quantiles.
///
/// The underlying distribution is discretized into `category_count`
/// rates at the quantiles (i + 0.5) / count, and a category parameter
/// with one dimension per non-root branch assigns each branch to a
/// grid cell. Sampling moves integer category values rather than the
/// rates themselves, so the rate grid never changes while the
/// assignment does.
///
/// The branch-to-dimension mapping is keyed to the root node observed
/// at construction. Topology moves that keep the root are fine;
/// re-rooting would silently permute the assignment, so querying a
/// tree whose root has moved is a programming error and panics.
pub struct DiscretizedBranchRates {
    id: String,
    categories: Parameter,
    rates: Vec<f64>,
    root: NodeId,
}

impl DiscretizedBranchRates {
    pub fn new(
        id: &str,
        tree: &dyn Tree,
        distribution: &dyn RateDistribution,
        category_count: usize,
    ) -> Result<Self> {
        if category_count == 0 {
            return Err(VireoError::InvalidInput(
                "relaxed clock needs at least one rate category".into(),
            ));
        }
        let dimension = tree.node_count() - 1;
        let mut values = Vec::with_capacity(dimension);
        for i in 0..dimension {
            values.push(((i * category_count) / dimension) as f64);
        }
        let categories = Parameter::with_bounds(
            &format!("{}.categories", id),
            values,
            Bounds {
                lower: 0.0,
                upper: (category_count - 1) as f64,
            },
        );
        let mut rates = Vec::with_capacity(category_count);
        for i in 0..category_count {
            let p = (i as f64 + 0.5) / category_count as f64;
            let r = distribution.quantile(p);
            if !(r > 0.0) || !r.is_finite() {
                return Err(VireoError::Numerical(format!(
                    "relaxed clock {}: quantile {} gave non-positive rate {}",
                    id, p, r
                )));
            }
            rates.push(r);
        }
        info!(
            "relaxed clock {}: {} branches over {} rate categories",
            id, dimension, category_count
        );
        Ok(Self {
            id: id.to_string(),
            categories,
            rates,
            root: tree.root(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    /// The rate grid, ascending.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    /// The category parameter: one dimension per non-root branch.
    pub fn categories(&self) -> &Parameter {
        &self.categories
    }

    pub fn categories_mut(&mut self) -> &mut Parameter {
        &mut self.categories
    }

    /// Reassign the branch below `node` to a rate category.
    pub fn set_branch_category(
        &mut self,
        tree: &dyn Tree,
        node: NodeId,
        category: usize,
    ) -> Result<()> {
        let index = self.branch_index(tree, node);
        self.categories.set_value(index, category as f64)
    }

    /// Dimension of the category parameter holding `node`'s branch.
    ///
    /// Branches are numbered by their lower node, with the gap left
    /// by the root closed up.
    fn branch_index(&self, tree: &dyn Tree, node: NodeId) -> usize {
        let root = tree.root();
        assert!(
            root == self.root,
            "relaxed clock {}: category assignment is keyed to root {}, but the tree is now rooted at {}",
            self.id,
            self.root,
            root
        );
        assert!(node != root, "branch rate requested for the root node");
        if node < root {
            node
        } else {
            node - 1
        }
    }
}

impl BranchRates for DiscretizedBranchRates {
    fn branch_rate(&self, tree: &dyn Tree, node: NodeId) -> f64 {
        let category = self.categories.value(self.branch_index(tree, node)) as usize;
        self.rates[category]
    }
}

impl Stateful for DiscretizedBranchRates {
    fn store_state(&mut self) {
        self.categories.store_state();
    }

    fn restore_state(&mut self) {
        self.categories.restore_state();
    }

    fn accept_state(&mut self) {
        self.categories.accept_state();
    }
}

// ── Site rates ────────────────────────────────────────────────────────────

/// Discrete among-site rate variation: a handful of categories, each
/// with a rate and a proportion of sites, mean rate 1.
#[derive(Debug, Clone)]
pub struct SiteRates {
    rates: Vec<f64>,
    proportions: Vec<f64>,
}

impl SiteRates {
    /// A single category at rate 1: every site evolves identically.
    pub fn invariant() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
        }
    }

    /// Equal-proportion gamma categories.
    ///
    /// Category i takes the median of its quantile band, the
    /// (i + 0.5) / n quantile of Gamma(shape, 1/shape), and the rates
    /// are then normalized so their mean is exactly 1.
    pub fn gamma(shape: f64, category_count: usize) -> Result<Self> {
        if shape <= 0.0 {
            return Err(VireoError::InvalidInput(format!(
                "gamma shape must be positive, got {}",
                shape
            )));
        }
        if category_count == 0 {
            return Err(VireoError::InvalidInput(
                "site model needs at least one rate category".into(),
            ));
        }
        let n = category_count as f64;
        let mut rates = Vec::with_capacity(category_count);
        for i in 0..category_count {
            let p = (i as f64 + 0.5) / n;
            rates.push(gamma_quantile(shape, 1.0 / shape, p));
        }
        let mean: f64 = rates.iter().sum::<f64>() / n;
        for r in &mut rates {
            *r /= mean;
        }
        Ok(Self {
            rates,
            proportions: vec![1.0 / n; category_count],
        })
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    pub fn rate(&self, category: usize) -> f64 {
        self.rates[category]
    }

    pub fn proportion(&self, category: usize) -> f64 {
        self.proportions[category]
    }
}
