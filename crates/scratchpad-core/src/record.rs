//! Result records produced by a run.
//!
//! Everything a run reports, whether it comes from the worker, the compiler
//! or the package resolver, is a [`ResultRecord`] delivered in one ordered
//! stream. Records have no identity beyond their position in that stream.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a compile diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A compile-time problem with a 1-based source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            severity,
            message: message.into(),
            line,
            column,
        }
    }

    pub fn error(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(Severity::Error, message, line, column)
    }

    pub fn warning(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(Severity::Warning, message, line, column)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.line, self.column, self.severity, self.message
        )
    }
}

/// One unit of output from a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultRecord {
    /// A displayable value, possibly with nested children.
    Value {
        header: Option<String>,
        text: String,
        children: Vec<ResultRecord>,
    },

    /// An unhandled error with best-effort source line attribution.
    Exception {
        #[serde(rename = "type")]
        exception_type: String,
        message: String,
        line_number: Option<u32>,
        children: Vec<ResultRecord>,
    },

    /// A compile-time problem. Any error-severity diagnostic means the run
    /// never started.
    CompileDiagnostic(Diagnostic),

    /// Package restore progress, emitted before execution begins.
    RestoreProgress { message: String, is_error: bool },
}

impl ResultRecord {
    /// A leaf value without header.
    pub fn value(text: impl Into<String>) -> Self {
        Self::Value {
            header: None,
            text: text.into(),
            children: Vec::new(),
        }
    }

    /// A value with a header and nested children.
    pub fn value_tree(
        header: Option<String>,
        text: impl Into<String>,
        children: Vec<ResultRecord>,
    ) -> Self {
        Self::Value {
            header,
            text: text.into(),
            children,
        }
    }

    pub fn exception(
        exception_type: impl Into<String>,
        message: impl Into<String>,
        line_number: Option<u32>,
    ) -> Self {
        Self::Exception {
            exception_type: exception_type.into(),
            message: message.into(),
            line_number,
            children: Vec::new(),
        }
    }

    pub fn diagnostic(diagnostic: Diagnostic) -> Self {
        Self::CompileDiagnostic(diagnostic)
    }

    pub fn restore(message: impl Into<String>, is_error: bool) -> Self {
        Self::RestoreProgress {
            message: message.into(),
            is_error,
        }
    }

    /// Whether this record reports a failure.
    pub fn is_error(&self) -> bool {
        match self {
            Self::Value { .. } => false,
            Self::Exception { .. } => true,
            Self::CompileDiagnostic(d) => d.is_error(),
            Self::RestoreProgress { is_error, .. } => *is_error,
        }
    }

    /// Child records, in insertion order.
    pub fn children(&self) -> &[ResultRecord] {
        match self {
            Self::Value { children, .. } | Self::Exception { children, .. } => children,
            _ => &[],
        }
    }
}

impl From<Diagnostic> for ResultRecord {
    fn from(diagnostic: Diagnostic) -> Self {
        Self::CompileDiagnostic(diagnostic)
    }
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value { header, text, .. } => match header {
                Some(header) => write!(f, "{}: {}", header, text),
                None => write!(f, "{}", text),
            },
            Self::Exception {
                exception_type,
                message,
                line_number,
                ..
            } => match line_number {
                Some(line) => write!(f, "{} (line {}): {}", exception_type, line, message),
                None => write!(f, "{}: {}", exception_type, message),
            },
            Self::CompileDiagnostic(d) => write!(f, "{}", d),
            Self::RestoreProgress { message, .. } => write!(f, "{}", message),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The worker reported `RunComplete`.
    Completed,
    /// The run was canceled, cooperatively or by killing the worker.
    Canceled,
    /// The worker died or the channel broke mid-run.
    Crashed { message: String },
    /// Compilation reported errors; the worker was not touched.
    CompileFailed,
    /// A package could not be restored; the worker was not touched.
    RestoreFailed,
    /// The worker could not be started.
    LaunchFailed,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Crashed { message } => write!(f, "crashed: {}", message),
            Self::CompileFailed => write!(f, "compilation failed"),
            Self::RestoreFailed => write!(f, "package restore failed"),
            Self::LaunchFailed => write!(f, "worker launch failed"),
        }
    }
}

/// An item of a run stream: records, then exactly one terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Record(ResultRecord),
    Finished(RunOutcome),
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}
