//! Running snippets for a document.
//!
//! - [`ExecutionCoordinator`]: per-document run pipeline and state machine
//! - [`CancelToken`]: cooperative cancellation shared by the pipeline stages

mod context;
mod coordinator;

pub use context::CancelToken;
pub use coordinator::{ExecutionCoordinator, RunState, RunTicket};
