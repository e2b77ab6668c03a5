//! Where packages come from.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::directive::PackageReference;

/// Installs a package into an empty cache directory.
pub trait PackageSource: Send + Sync {
    fn install<'a>(
        &'a self,
        reference: &'a PackageReference,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Copies packages out of a local feed laid out as `<feed>/<id>/<version>/`.
#[derive(Debug, Clone)]
pub struct LocalFeedSource {
    feed: PathBuf,
}

impl LocalFeedSource {
    pub fn new(feed: impl Into<PathBuf>) -> Self {
        Self { feed: feed.into() }
    }

    fn locate(&self, reference: &PackageReference) -> Option<PathBuf> {
        let candidates = [
            self.feed.join(&reference.id).join(&reference.version),
            self.feed
                .join(reference.id.to_lowercase())
                .join(reference.version.to_lowercase()),
        ];
        candidates.into_iter().find(|dir| dir.is_dir())
    }
}

impl PackageSource for LocalFeedSource {
    fn install<'a>(
        &'a self,
        reference: &'a PackageReference,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let source = self.locate(reference).ok_or_else(|| Error::DependencyResolution {
                package_id: reference.id.clone(),
                message: format!(
                    "version {} not found in feed {}",
                    reference.version,
                    self.feed.display()
                ),
            })?;
            copy_dir(&source, dest).await
        })
    }

    fn describe(&self) -> String {
        format!("feed {}", self.feed.display())
    }
}

async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst)
            .await
            .map_err(|e| Error::at_path(&dst, e))?;

        let mut entries = tokio::fs::read_dir(&src)
            .await
            .map_err(|e| Error::at_path(&src, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::at_path(&src, e))?
        {
            let path = entry.path();
            let target = dst.join(entry.file_name());
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::at_path(&path, e))?;
            if file_type.is_dir() {
                pending.push((path, target));
            } else {
                tokio::fs::copy(&path, &target)
                    .await
                    .map_err(|e| Error::at_path(&path, e))?;
            }
        }
    }

    Ok(())
}

/// Runs an external restore command per package.
///
/// `{id}`, `{version}` and `{dest}` in the arguments are replaced before the
/// command runs. A nonzero exit fails the install.
#[derive(Debug, Clone)]
pub struct CommandPackageSource {
    program: String,
    args: Vec<String>,
}

impl CommandPackageSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Source from a command line, program first. `None` when empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    fn expand(&self, reference: &PackageReference, dest: &Path) -> Vec<String> {
        let dest = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{id}", &reference.id)
                    .replace("{version}", &reference.version)
                    .replace("{dest}", &dest)
            })
            .collect()
    }
}

impl PackageSource for CommandPackageSource {
    fn install<'a>(
        &'a self,
        reference: &'a PackageReference,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = self.expand(reference, dest);
            tracing::debug!(package = %reference, program = %self.program, ?args, "running restore command");

            let output = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| Error::DependencyResolution {
                    package_id: reference.id.clone(),
                    message: format!("failed to run {}: {}", self.program, e),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = stderr.lines().last().unwrap_or("").trim().to_string();
                return Err(Error::DependencyResolution {
                    package_id: reference.id.clone(),
                    message: match output.status.code() {
                        Some(code) if detail.is_empty() => {
                            format!("{} exited with code {}", self.program, code)
                        }
                        Some(code) => format!("{} exited with code {}: {}", self.program, code, detail),
                        None => format!("{} was terminated by a signal", self.program),
                    },
                });
            }
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("command {}", self.program)
    }
}

/// Used when no source is configured; every install fails.
#[derive(Debug, Clone, Default)]
pub struct NoPackageSource;

impl PackageSource for NoPackageSource {
    fn install<'a>(
        &'a self,
        reference: &'a PackageReference,
        _dest: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Err(Error::DependencyResolution {
                package_id: reference.id.clone(),
                message: "no package source configured".to_string(),
            })
        })
    }

    fn describe(&self) -> String {
        "no source".to_string()
    }
}
