//! Out-of-process execution engine for the scratchpad.
//!
//! This crate provides:
//! - The result record model shared by every stage of a run
//! - The worker wire protocol and worker supervision
//! - Package reference parsing, caching and restore
//! - The snippet compiler
//! - The per-document execution coordinator

pub mod compile;
pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod packages;
pub mod paths;
pub mod platform;
pub mod record;

pub use compile::{CompileOutput, Compiler, Program, SnippetCompiler};
pub use config::{CoordinatorConfig, ResolverConfig, ScratchpadConfig, SupervisorConfig};
pub use error::{Error, Result};
pub use execute::{CancelToken, ExecutionCoordinator, RunState, RunTicket};
pub use ipc::{RunStream, WorkerHandle, WorkerLauncher, WorkerSupervisor};
pub use packages::{PackageCache, PackageReference, PackageResolver, PackageSource};
pub use paths::DocumentDirs;
pub use platform::{Architecture, Platform, RuntimeKind};
pub use record::{Diagnostic, ResultRecord, RunEvent, RunOutcome, Severity};
