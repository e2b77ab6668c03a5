//! Document directory management.
//!
//! Provides a consistent directory layout for scratchpad documents so the CLI
//! and any other front end agree on where artifacts go.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory structure for a scratchpad document.
///
/// Everything lives in a `.scratchpad` directory next to the document:
///
/// ```text
/// snippet.sp
/// .scratchpad/
/// ├── build/   # Emitted payloads
/// └── work/    # Worker working directory
/// ```
#[derive(Debug, Clone)]
pub struct DocumentDirs {
    /// The `.scratchpad` directory itself.
    pub root: PathBuf,

    /// Output directory for `compile_and_emit`.
    pub build_dir: PathBuf,

    /// Working directory handed to the worker.
    pub work_dir: PathBuf,
}

impl DocumentDirs {
    /// Create the layout for a document file, creating missing directories.
    pub fn from_document_path(document_path: &Path) -> Result<Self> {
        let document_dir = match document_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        Self::from_document_dir(document_dir)
    }

    /// Create the layout inside a directory, creating missing directories.
    pub fn from_document_dir(document_dir: &Path) -> Result<Self> {
        let root = document_dir.join(".scratchpad");
        let build_dir = root.join("build");
        let work_dir = root.join("work");

        for dir in [&build_dir, &work_dir] {
            fs::create_dir_all(dir).map_err(|e| Error::at_path(dir, e))?;
        }

        Ok(Self {
            root,
            build_dir,
            work_dir,
        })
    }

    /// Default emit path for a document: `build/<stem>.payload.json`.
    pub fn artifact_path(&self, document_path: &Path) -> PathBuf {
        let stem = document_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "snippet".to_string());
        self.build_dir.join(format!("{}.payload.json", stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_document_path() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let document = temp.path().join("test.sp");

        let dirs = DocumentDirs::from_document_path(&document).expect("Failed to create dirs");

        assert!(dirs.root.ends_with(".scratchpad"));
        assert!(dirs.build_dir.exists());
        assert!(dirs.work_dir.exists());
        assert_eq!(
            dirs.artifact_path(&document),
            dirs.build_dir.join("test.payload.json")
        );
    }
}
