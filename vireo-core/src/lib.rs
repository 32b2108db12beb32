//! Shared primitives for the Vireo phylogenetic inference kernel.
//!
//! `vireo-core` provides the foundation the domain crates build on:
//!
//! - **Error types** — [`VireoError`] and [`Result`] for structured error handling
//! - **Traits** — Small cross-crate abstractions like [`Summarizable`]

pub mod error;
pub mod traits;

pub use error::{Result, VireoError};
pub use traits::*;
