//! On-disk package cache.
//!
//! Layout: `<root>/<id lowercase>/<version lowercase>/`. A package counts as
//! installed only once its `.complete` marker exists; a directory without the
//! marker is a leftover of an interrupted install and is replaced.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::directive::PackageReference;

const COMPLETE_MARKER: &str = ".complete";

#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic install directory of a package.
    pub fn package_dir(&self, reference: &PackageReference) -> PathBuf {
        self.root
            .join(reference.id.to_lowercase())
            .join(reference.version.to_lowercase())
    }

    pub fn is_installed(&self, reference: &PackageReference) -> bool {
        self.package_dir(reference).join(COMPLETE_MARKER).is_file()
    }

    /// Empty install directory for `reference`, discarding partial leftovers.
    pub async fn prepare(&self, reference: &PackageReference) -> Result<PathBuf> {
        let dir = self.package_dir(reference);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::at_path(&dir, e))?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::at_path(&dir, e))?;
        Ok(dir)
    }

    /// Mark an install as finished.
    pub async fn mark_complete(&self, reference: &PackageReference) -> Result<PathBuf> {
        let dir = self.package_dir(reference);
        let marker = dir.join(COMPLETE_MARKER);
        tokio::fs::write(&marker, reference.to_string())
            .await
            .map_err(|e| Error::at_path(&marker, e))?;
        Ok(dir)
    }
}
