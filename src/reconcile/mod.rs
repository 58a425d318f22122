//! Reconciliation of external state into Discord messages.
//!
//! Each reconciler diffs what a provider reports right now against what the
//! store says was already announced, and drives Discord REST calls to close
//! the gap. A failure on one item is logged and counted; the item is retried
//! on the next pass because its store row was left untouched.

mod runs;
mod streams;

pub use runs::{RunPass, RunReconciler};
pub use streams::{StreamPass, StreamReconciler};
