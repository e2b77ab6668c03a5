//! Compilation of snippet source into worker payloads.
//!
//! This module provides:
//! - The [`Compiler`] seam the coordinator compiles through
//! - [`SnippetCompiler`], the built-in compiler for the snippet language
//! - The [`Program`] tree that forms the payload
//!
//! # Architecture
//!
//! ```text
//! Snippet source
//!     │
//!     ├── #r directives ──► reference_directives ──► PackageResolver
//!     │
//!     └── Statements ──► lexer ──► parser ──► Program ──► JSON payload ──► worker
//! ```

pub mod ast;
mod lexer;
mod parser;

use std::path::Path;

use crate::error::{Error, Result};
use crate::packages::directive;
use crate::record::Diagnostic;

pub use ast::{BinOp, Expr, Program, Statement, StatementKind};

/// Result of compiling a snippet.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// Executable payload; `None` when any diagnostic is an error.
    pub payload: Option<Vec<u8>>,
    /// Diagnostics in source order.
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// The payload, or [`Error::Compile`] carrying the diagnostics.
    pub fn into_payload(self) -> Result<Vec<u8>> {
        match self.payload {
            Some(payload) if !self.has_errors() => Ok(payload),
            _ => Err(Error::Compile {
                diagnostics: self.diagnostics,
            }),
        }
    }

    /// Write the payload to `path`, creating parent directories.
    pub fn write_artifact(&self, path: &Path) -> Result<()> {
        let payload = match &self.payload {
            Some(payload) if !self.has_errors() => payload,
            _ => {
                return Err(Error::Compile {
                    diagnostics: self.diagnostics.clone(),
                });
            }
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::at_path(parent, e))?;
            }
        }
        std::fs::write(path, payload).map_err(|e| Error::at_path(path, e))
    }
}

/// Turns source text into an executable payload.
pub trait Compiler: Send + Sync {
    /// Compile `source`. Never fails outright; problems are diagnostics.
    fn compile(&self, source: &str) -> CompileOutput;

    /// Raw `#r` directive bodies in source order.
    fn reference_directives(&self, source: &str) -> Vec<String>;
}

/// Compiler for the built-in snippet language.
#[derive(Debug, Clone, Default)]
pub struct SnippetCompiler;

impl SnippetCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for SnippetCompiler {
    fn compile(&self, source: &str) -> CompileOutput {
        let (tokens, mut diagnostics) = lexer::tokenize(source);
        let (program, parse_diagnostics) = parser::parse(&tokens);
        diagnostics.extend(parse_diagnostics);
        diagnostics.sort_by_key(|d| (d.line, d.column));

        if diagnostics.iter().any(Diagnostic::is_error) {
            return CompileOutput {
                payload: None,
                diagnostics,
            };
        }

        match program.to_payload() {
            Ok(payload) => CompileOutput {
                payload: Some(payload),
                diagnostics,
            },
            Err(e) => {
                diagnostics.push(Diagnostic::error(e.to_string(), 1, 1));
                CompileOutput {
                    payload: None,
                    diagnostics,
                }
            }
        }
    }

    fn reference_directives(&self, source: &str) -> Vec<String> {
        directive::reference_directives(source)
    }
}
