//! Fixed-step quadrature with an underflow-rescaling retry loop.
//!
//! Likelihood surfaces integrated over a nuisance parameter are
//! frequently so small that the integrand underflows to zero across
//! the whole domain. [`integrate_rescaled`] drives a handshake with
//! the integrand: after each attempt the integrand reports whether
//! any evaluation underflowed, and if so its internal scale factor
//! grows by x10 and the integral is retried, up to a hard cap.

use log::info;
use vireo_core::{Result, VireoError};

/// Maximum x10 scale growths before the retry loop gives up.
const MAX_RESCALINGS: u32 = 64;

/// A univariate function with an integration domain.
///
/// `upper_bound` may be `f64::INFINITY`; the integrator then applies
/// the change of variables x = 1/u - 1 onto (0, 1].
pub trait Integrand {
    fn evaluate(&mut self, x: f64) -> f64;
    fn lower_bound(&self) -> f64;
    fn upper_bound(&self) -> f64;
}

/// An [`Integrand`] that detects its own underflow and carries an
/// adjustable scale factor.
pub trait RescalableIntegrand: Integrand {
    /// True if any evaluation since the last scale change underflowed.
    fn needs_rescaling(&self) -> bool;
    /// Multiply the internal scale factor by 10, clearing the
    /// underflow flag.
    fn grow_scale(&mut self);
    /// Natural log of the current scale factor, to be subtracted from
    /// the log of the integral.
    fn ln_scale(&self) -> f64;
}

/// Composite midpoint rule with a fixed number of steps.
#[derive(Debug, Clone, Copy)]
pub struct RiemannIntegrator {
    steps: usize,
}

impl RiemannIntegrator {
    pub fn new(steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(VireoError::InvalidInput(
                "integrator needs at least one step".into(),
            ));
        }
        Ok(Self { steps })
    }

    /// Integrate over the integrand's own domain.
    pub fn integrate(&self, f: &mut dyn Integrand) -> f64 {
        let lower = f.lower_bound();
        let upper = f.upper_bound();
        if upper.is_infinite() {
            // x = lower + 1/u - 1 maps u in (0, 1] onto [lower, inf);
            // dx = du / u^2.
            let h = 1.0 / self.steps as f64;
            let mut sum = 0.0;
            for i in 0..self.steps {
                let u = (i as f64 + 0.5) * h;
                sum += f.evaluate(lower + 1.0 / u - 1.0) / (u * u);
            }
            sum * h
        } else {
            let h = (upper - lower) / self.steps as f64;
            let mut sum = 0.0;
            for i in 0..self.steps {
                sum += f.evaluate(lower + (i as f64 + 0.5) * h);
            }
            sum * h
        }
    }
}

/// Integrate with the x10 rescaling retry loop.
///
/// Returns the integral of the *scaled* function; the caller recovers
/// the true log value as `result.ln() - f.ln_scale()`. Exhausting the
/// retry cap is a fatal [`VireoError::Numerical`].
pub fn integrate_rescaled(
    integrator: &RiemannIntegrator,
    f: &mut dyn RescalableIntegrand,
) -> Result<f64> {
    for round in 0..=MAX_RESCALINGS {
        let result = integrator.integrate(f);
        if !f.needs_rescaling() {
            if round > 0 {
                info!("integral recovered after {} rescalings", round);
            }
            return Ok(result);
        }
        f.grow_scale();
    }
    Err(VireoError::Numerical(format!(
        "integral still underflows after {} x10 rescalings",
        MAX_RESCALINGS
    )))
}
