//! Bounded real-valued vectors with reversible updates.
//!
//! A [`Parameter`] is the unit of numeric state outside the tree: site
//! rate shapes, clock rates, per-branch category assignments. Writes
//! record which indices changed so owners can invalidate caches, and
//! the [`Stateful`] protocol gives single-level snapshot and rollback.

use vireo_core::{Result, VireoError};

use crate::state::Stateful;

/// Inclusive bounds applied uniformly across a parameter's dimensions.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Bounds {
    pub const UNBOUNDED: Bounds = Bounds {
        lower: f64::NEG_INFINITY,
        upper: f64::INFINITY,
    };

    pub const POSITIVE: Bounds = Bounds {
        lower: 0.0,
        upper: f64::INFINITY,
    };

    fn contains(&self, v: f64) -> bool {
        v >= self.lower && v <= self.upper
    }
}

/// A named vector of real values with bounds and change tracking.
#[derive(Debug, Clone)]
pub struct Parameter {
    id: String,
    values: Vec<f64>,
    bounds: Bounds,
    stored: Option<Vec<f64>>,
    changed: Vec<usize>,
}

impl Parameter {
    pub fn new(id: &str, values: Vec<f64>) -> Self {
        Self::with_bounds(id, values, Bounds::UNBOUNDED)
    }

    pub fn with_bounds(id: &str, values: Vec<f64>, bounds: Bounds) -> Self {
        Self {
            id: id.to_string(),
            values,
            bounds,
            stored: None,
            changed: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Set one dimension, rejecting out-of-bounds values.
    pub fn set_value(&mut self, index: usize, value: f64) -> Result<()> {
        if index >= self.values.len() {
            return Err(VireoError::InvalidInput(format!(
                "parameter {}: index {} out of range (dimension {})",
                self.id,
                index,
                self.values.len()
            )));
        }
        if !self.bounds.contains(value) {
            return Err(VireoError::InvalidInput(format!(
                "parameter {}: value {} outside bounds [{}, {}]",
                self.id, value, self.bounds.lower, self.bounds.upper
            )));
        }
        self.values[index] = value;
        self.changed.push(index);
        Ok(())
    }

    /// Replace all values at once. Dimension must match.
    pub fn set_all(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.values.len() {
            return Err(VireoError::InvalidInput(format!(
                "parameter {}: dimension mismatch ({} given, {} held)",
                self.id,
                values.len(),
                self.values.len()
            )));
        }
        for (i, &v) in values.iter().enumerate() {
            self.set_value(i, v)?;
        }
        Ok(())
    }

    /// Drain the indices written since the previous drain.
    ///
    /// Indices appear in write order and may repeat.
    pub fn take_changes(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.changed)
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

impl Stateful for Parameter {
    fn store_state(&mut self) {
        assert!(
            self.stored.is_none(),
            "parameter {}: store_state while a snapshot is already held",
            self.id
        );
        self.stored = Some(self.values.clone());
    }

    fn restore_state(&mut self) {
        let stored = self
            .stored
            .take()
            .unwrap_or_else(|| panic!("parameter {}: restore_state without a snapshot", self.id));
        self.values = stored;
        self.changed.clear();
    }

    fn accept_state(&mut self) {
        assert!(
            self.stored.take().is_some(),
            "parameter {}: accept_state without a snapshot",
            self.id
        );
    }
}

/// Read-only matrix-valued parameter defined as the product of two
/// stored matrices.
///
/// Entries are computed on demand; any attempt to write through the
/// vector interface is rejected with [`VireoError::InvalidOperation`]
/// naming the parameter and the refused operation.
#[derive(Debug, Clone)]
pub struct ProductParameter {
    id: String,
    left: Parameter,
    right: Parameter,
    rows: usize,
    inner: usize,
    cols: usize,
}

impl ProductParameter {
    /// `left` holds a rows x inner matrix, `right` an inner x cols
    /// matrix, both row-major.
    pub fn new(
        id: &str,
        left: Parameter,
        right: Parameter,
        rows: usize,
        inner: usize,
        cols: usize,
    ) -> Result<Self> {
        if left.dimension() != rows * inner {
            return Err(VireoError::InvalidInput(format!(
                "product parameter {}: left factor has dimension {}, expected {}x{}",
                id,
                left.dimension(),
                rows,
                inner
            )));
        }
        if right.dimension() != inner * cols {
            return Err(VireoError::InvalidInput(format!(
                "product parameter {}: right factor has dimension {}, expected {}x{}",
                id,
                right.dimension(),
                inner,
                cols
            )));
        }
        Ok(Self {
            id: id.to_string(),
            left,
            right,
            rows,
            inner,
            cols,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn column_count(&self) -> usize {
        self.cols
    }

    pub fn dimension(&self) -> usize {
        self.rows * self.cols
    }

    /// Entry (i, j) of the product, computed on demand.
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        let mut sum = 0.0;
        for k in 0..self.inner {
            sum += self.left.value(i * self.inner + k) * self.right.value(k * self.cols + j);
        }
        sum
    }

    /// Flat row-major read of the product.
    pub fn value(&self, index: usize) -> f64 {
        self.entry(index / self.cols, index % self.cols)
    }

    /// Writes are not allowed: the value is a deterministic function
    /// of the two factors.
    pub fn set_value(&mut self, _index: usize, _value: f64) -> Result<()> {
        self.refuse("set_value")
    }

    pub fn set_all(&mut self, _values: &[f64]) -> Result<()> {
        self.refuse("set_all")
    }

    fn refuse(&self, operation: &str) -> Result<()> {
        Err(VireoError::InvalidOperation {
            target: self.id.clone(),
            operation: operation.to_string(),
        })
    }

    /// Mutable access to the factors, which are the writable state.
    pub fn left_mut(&mut self) -> &mut Parameter {
        &mut self.left
    }

    pub fn right_mut(&mut self) -> &mut Parameter {
        &mut self.right
    }
}

impl Stateful for ProductParameter {
    fn store_state(&mut self) {
        self.left.store_state();
        self.right.store_state();
    }

    fn restore_state(&mut self) {
        self.left.restore_state();
        self.right.restore_state();
    }

    fn accept_state(&mut self) {
        self.left.accept_state();
        self.right.accept_state();
    }
}
