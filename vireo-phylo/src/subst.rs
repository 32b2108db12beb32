//! Substitution models: transition probabilities over a branch.
//!
//! Models fill a flattened row-major `state_count x state_count`
//! buffer with P(t) = exp(Qt) for an evolutionary distance `t`, so
//! the likelihood engine can reuse one allocation per (node,
//! category) slot.

use vireo_core::{Result, VireoError};

/// A time-reversible substitution model over a fixed alphabet.
pub trait SubstitutionModel {
    /// Number of character states.
    fn state_count(&self) -> usize;

    /// Equilibrium frequencies, one per state, summing to 1.
    fn frequencies(&self) -> &[f64];

    /// Fill `probs` (flattened row-major, length `state_count²`) with
    /// the transition probability matrix for evolutionary distance
    /// `distance`.
    fn transition_probabilities(&self, distance: f64, probs: &mut [f64]);
}

/// Jukes-Cantor 1969: equal base frequencies, one substitution rate.
///
/// P(same) = 1/4 + 3/4 e^{-4t/3}, P(diff) = 1/4 - 1/4 e^{-4t/3}.
#[derive(Debug, Clone, Copy)]
pub struct Jc69 {
    freqs: [f64; 4],
}

impl Jc69 {
    pub fn new() -> Self {
        Self { freqs: [0.25; 4] }
    }
}

impl Default for Jc69 {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for Jc69 {
    fn state_count(&self) -> usize {
        4
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn transition_probabilities(&self, distance: f64, probs: &mut [f64]) {
        debug_assert_eq!(probs.len(), 16);
        let e = (-4.0 * distance / 3.0).exp();
        let p_same = 0.25 + 0.75 * e;
        let p_diff = 0.25 - 0.25 * e;
        for i in 0..4 {
            for j in 0..4 {
                probs[i * 4 + j] = if i == j { p_same } else { p_diff };
            }
        }
    }
}

/// Symmetric two-state model with arbitrary equilibrium frequencies.
///
/// For frequencies (π₀, π₁) the transition probabilities are
/// P(i → j) = πⱼ + (δᵢⱼ − πⱼ) e^{−t/(2π₀π₁)}, normalized so one unit
/// of distance is one expected substitution per site at equilibrium.
#[derive(Debug, Clone, Copy)]
pub struct TwoState {
    freqs: [f64; 2],
}

impl TwoState {
    /// Equal frequencies (the Mk model on two states).
    pub fn symmetric() -> Self {
        Self { freqs: [0.5, 0.5] }
    }

    pub fn new(freq0: f64) -> Result<Self> {
        if !(freq0 > 0.0 && freq0 < 1.0) {
            return Err(VireoError::InvalidInput(format!(
                "two-state frequency must lie in (0, 1), got {}",
                freq0
            )));
        }
        Ok(Self {
            freqs: [freq0, 1.0 - freq0],
        })
    }
}

impl SubstitutionModel for TwoState {
    fn state_count(&self) -> usize {
        2
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn transition_probabilities(&self, distance: f64, probs: &mut [f64]) {
        debug_assert_eq!(probs.len(), 4);
        let (p0, p1) = (self.freqs[0], self.freqs[1]);
        let e = (-distance / (2.0 * p0 * p1)).exp();
        probs[0] = p0 + p1 * e; // 0 -> 0
        probs[1] = p1 - p1 * e; // 0 -> 1
        probs[2] = p0 - p0 * e; // 1 -> 0
        probs[3] = p1 + p0 * e; // 1 -> 1
    }
}
