//! Structured error types for the Vireo inference kernel.

use thiserror::Error;

/// Unified error type for all Vireo operations.
///
/// The variants follow the kernel's error taxonomy: structural errors
/// indicate a bug in model construction or an operator and are never
/// retried; numerical errors are recovered once (rescaled arithmetic)
/// and escalated only if recovery is exhausted.
#[derive(Debug, Error)]
pub enum VireoError {
    /// Structural error (orphaned node, height inversion, negative
    /// branch length, partition dead-end). Fatal, non-recoverable.
    #[error("structural error: {0}")]
    Structural(String),

    /// Numerical error (underflow despite rescaling, integral overflow
    /// after exhausting the rescaling retry budget).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A taxon referenced by the tip-data source is not present in the
    /// tree (or vice versa). Fatal at construction.
    #[error("missing taxon: {0}")]
    MissingTaxon(String),

    /// An operation that is not allowed on the target object, e.g.
    /// directly setting a value that is computed from other parameters.
    #[error("invalid operation on {target}: {operation} is not allowed")]
    InvalidOperation {
        /// Identity of the offending object.
        target: String,
        /// The disallowed operation.
        operation: String,
    },

    /// Invalid input (bad arguments, out-of-range values).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Convenience alias used throughout the Vireo workspace.
pub type Result<T> = std::result::Result<T, VireoError>;
