//! Phylogenetic likelihood kernel for the Vireo inference ecosystem.
//!
//! The crate centers on an incremental-recompute engine for tree
//! likelihoods under MCMC:
//!
//! - **Trees** — arena-indexed rooted trees ([`tree`], [`tree_model`])
//!   with change notification and a validated edit protocol
//! - **Traversal library** — pure queries, MRCA/monophyly, Newick
//!   serialization ([`tree_utils`])
//! - **Reversible state** — the store/restore/accept contract every
//!   sampled component implements ([`state`], [`parameter`])
//! - **Likelihood** — Felsenstein pruning with dirty-node tracking,
//!   double-buffered storage and underflow rescaling ([`likelihood`]),
//!   plus the partitioned-graph extension ([`graph`])
//! - **Models** — substitution models, site and branch rates
//!   ([`subst`], [`rates`], [`patterns`])
//! - **Support** — quadrature with rescaling retry ([`integrate`]),
//!   log columns ([`columns`]), a Metropolis-Hastings driver ([`mcmc`])

pub mod columns;
pub mod graph;
pub mod integrate;
pub mod likelihood;
pub mod mcmc;
pub mod parameter;
pub mod patterns;
pub mod rates;
pub mod state;
pub mod subst;
pub mod tree;
pub mod tree_model;
pub mod tree_utils;

pub use likelihood::TreeLikelihood;
pub use parameter::Parameter;
pub use patterns::SitePatterns;
pub use state::Stateful;
pub use tree::{Node, NodeId, Tree};
pub use tree_model::{TreeBuilder, TreeModel};
