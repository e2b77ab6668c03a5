//! Inter-process communication with worker processes.
//!
//! - [`protocol`]: framed messages exchanged with a worker
//! - [`launcher`]: starting worker processes
//! - [`worker`]: supervising a worker and streaming its runs
//! - [`simulated`]: in-process workers for tests

pub mod launcher;
pub mod protocol;
pub mod simulated;
pub mod worker;

pub use launcher::{LaunchRequest, ProcessLauncher, WorkerConnection, WorkerLauncher, WorkerProcess};
pub use protocol::{WorkerCommand, WorkerMessage};
pub use worker::{RunStream, WORKER_CRASHED, WorkerHandle, WorkerSupervisor};
