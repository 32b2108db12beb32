//! The reversible-state protocol every stateful component implements.
//!
//! The MCMC loop brackets each proposal with `store_state()` before
//! mutating anything and exactly one of `accept_state()` or
//! `restore_state()` afterwards. Snapshot nesting depth is exactly one
//! level: a second `store_state()` before a matching restore/accept is
//! a programming error and panics.

/// Store/restore/accept contract for reversible MCMC moves.
///
/// Composite components (a likelihood owning a tree and several
/// parameters) propagate all three calls to every owned sub-component
/// in a fixed order, whether or not the sub-component has a pending
/// change: an unchanged sub-component must still report "unchanged"
/// correctly on restore.
pub trait Stateful {
    /// Snapshot every internally cached quantity needed to undo the
    /// next mutation. Panics if a snapshot is already held.
    fn store_state(&mut self);

    /// Roll back to the snapshot, discarding work done since
    /// `store_state()`. Observable values (not object identity) must
    /// equal the pre-store state exactly. Panics if no snapshot is
    /// held.
    fn restore_state(&mut self);

    /// Discard the snapshot without restoring; used on proposal
    /// acceptance. Panics if no snapshot is held.
    fn accept_state(&mut self);
}
