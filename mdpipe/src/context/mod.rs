//! Ambient per-attempt context.
//!
//! Every stage invocation and inline effect observes an immutable
//! [`AmbientContext`] snapshot built by the [`ContextProvider`]. Snapshots
//! are copy-on-read: a parallel branch can never see another branch's
//! in-progress state.

mod ambient;
mod provider;

pub use ambient::{AmbientContext, AttemptOutcome, AttemptRecord};
pub use provider::ContextProvider;
