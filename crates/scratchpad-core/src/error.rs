//! Error types for scratchpad-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::record::Diagnostic;

/// Result type for scratchpad-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scratchpad-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker executable or its runtime could not be started.
    #[error("failed to launch worker for {platform}: {message}")]
    WorkerLaunch { platform: String, message: String },

    /// The worker did not signal readiness in time.
    #[error("worker did not become ready within {0:?}")]
    HandshakeTimeout(Duration),

    /// A run is already in flight for this handle or document.
    #[error("an execution is already in progress")]
    ExecutionAlreadyInProgress,

    /// Reading from or writing to the worker channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A referenced package could not be made available.
    #[error("failed to restore package {package_id}: {message}")]
    DependencyResolution { package_id: String, message: String },

    /// Compilation produced at least one error diagnostic.
    #[error("compilation failed with {} error(s)", .diagnostics.iter().filter(|d| d.is_error()).count())]
    Compile { diagnostics: Vec<Diagnostic> },

    /// Encoding or decoding a message failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error on a specific path.
    #[error("IO error at {}: {message}", path.display())]
    Path { path: PathBuf, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was canceled by request.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Attach a path to an IO error.
    pub fn at_path(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Short type name used when an error is surfaced as an exception record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerLaunch { .. } => "WorkerLaunchError",
            Self::HandshakeTimeout(_) => "HandshakeTimeout",
            Self::ExecutionAlreadyInProgress => "ExecutionAlreadyInProgress",
            Self::Transport(_) => "TransportError",
            Self::Protocol(_) => "ProtocolError",
            Self::DependencyResolution { .. } => "DependencyResolutionError",
            Self::Compile { .. } => "CompileError",
            Self::Serialization(_) => "SerializationError",
            Self::Config(_) => "ConfigError",
            Self::Path { .. } | Self::Io(_) => "IoError",
            Self::Canceled => "Canceled",
        }
    }

    /// Recovery hint shown by front ends next to the error message.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::WorkerLaunch { .. } => Some(
                "set SCRATCHPAD_WORKER_PATH or install scratchpad-worker next to the scratchpad binary",
            ),
            Self::HandshakeTimeout(_) => {
                Some("the worker may be blocked at startup; check its stderr output with -v")
            }
            Self::DependencyResolution { .. } => {
                Some("check SCRATCHPAD_PACKAGE_FEED or the package id and version")
            }
            _ => None,
        }
    }

    /// Render the error with its hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
