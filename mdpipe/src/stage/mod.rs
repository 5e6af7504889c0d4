//! Stage execution: backends, single-stage runs, and parallel groups.

mod backend;
mod executor;
mod parallel;

pub use backend::{CallableRef, ChunkRelay, ExecutorBackend, FnBackend, Handler};
pub use executor::{classify_return, RetrySignal, StageExecutor, StageReturn};
pub use parallel::{BranchCoordinator, GroupOutcome};
