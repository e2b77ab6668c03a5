//! Worker launching.
//!
//! A [`WorkerLauncher`] turns a platform and working directory into a live
//! duplex channel plus a handle on the process behind it. The supervisor only
//! sees this seam, so real child processes and in-process simulations are
//! interchangeable.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use crate::config::WORKER_PATH_ENV;
use crate::error::{Error, Result};
use crate::platform::Platform;

use super::protocol::{CHANNEL_ARG, WORKING_DIR_ARG};

/// Read half of a worker channel.
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a worker channel.
pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The process behind a worker channel.
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Forcefully terminate the process and reap it.
    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>>;

    /// Wait for the process to exit, returning its exit code if it had one.
    fn wait(&mut self) -> BoxFuture<'_, io::Result<Option<i32>>>;
}

impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(Child::kill(self))
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<Option<i32>>> {
        Box::pin(async move { Child::wait(self).await.map(|status| status.code()) })
    }
}

/// What the supervisor asks a launcher for.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub platform: Platform,
    pub working_dir: PathBuf,
    /// Id the worker must echo back in its `Ready` message.
    pub channel: String,
}

/// A freshly launched worker, before the handshake.
pub struct WorkerConnection {
    pub reader: WorkerReader,
    pub writer: WorkerWriter,
    pub process: Box<dyn WorkerProcess>,
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<WorkerConnection>;
}

/// Launches `scratchpad-worker` binaries as child processes over stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    /// Explicit binary, used for every platform.
    worker_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(worker_path: Option<PathBuf>) -> Self {
        Self { worker_path }
    }

    /// Find the worker binary for a platform.
    ///
    /// Looks in the following order:
    /// 1. The configured path
    /// 2. `SCRATCHPAD_WORKER_PATH` environment variable
    /// 3. Same directory as the current executable
    /// 4. System PATH
    /// 5. `target/{debug,release}` when running from the source tree
    pub fn find_worker_binary(&self, platform: &Platform) -> Result<PathBuf> {
        if let Some(path) = &self.worker_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(launch_error(
                platform,
                format!("configured worker '{}' does not exist", path.display()),
            ));
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        let worker_name = executable_name(&platform.worker_binary_name());

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let candidate = exe_dir.join(&worker_name);
                if candidate.exists() {
                    return Ok(candidate);
                }
                // Test binaries live one level down in target/<profile>/deps.
                if let Some(profile_dir) = exe_dir.parent() {
                    let candidate = profile_dir.join(&worker_name);
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                }
            }
        }

        if let Ok(path) = which::which(&worker_name) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in ["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(&worker_name);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(launch_error(
            platform,
            format!(
                "could not find {}. Set {} or ensure it's in PATH",
                worker_name, WORKER_PATH_ENV
            ),
        ))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<WorkerConnection> {
        let worker_path = self.find_worker_binary(&request.platform)?;

        // The worker resolves the directory after it has already started in it.
        let working_dir = request
            .working_dir
            .canonicalize()
            .ok()
            .filter(|dir| dir.is_dir())
            .ok_or_else(|| {
                launch_error(
                    &request.platform,
                    format!(
                        "working directory '{}' does not exist",
                        request.working_dir.display()
                    ),
                )
            })?;

        let mut child = Command::new(&worker_path)
            .arg(WORKING_DIR_ARG)
            .arg(&working_dir)
            .arg(CHANNEL_ARG)
            .arg(&request.channel)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                launch_error(
                    &request.platform,
                    format!("failed to spawn '{}': {}", worker_path.display(), e),
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(&request.platform, "failed to get worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(&request.platform, "failed to get worker stdout"))?;

        // Always consume stderr so the worker never blocks on it.
        if let Some(stderr) = child.stderr.take() {
            let pid = child.id().unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(pid, "worker stderr: {}", line);
                }
            });
        }

        tracing::debug!(
            path = %worker_path.display(),
            platform = %request.platform,
            pid = child.id().unwrap_or_default(),
            "spawned worker process"
        );

        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(child),
        })
    }
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

fn launch_error(platform: &Platform, message: impl Into<String>) -> Error {
    Error::WorkerLaunch {
        platform: platform.short_id(),
        message: message.into(),
    }
}
