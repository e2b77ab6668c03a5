//! Per-document execution coordinator.
//!
//! The coordinator is what a front end talks to. It owns the document's
//! worker handle and runs the pipeline for each `run`:
//!
//! ```text
//! run(source)
//!     │
//!     ├── reference directives ──► PackageResolver ──► RestoreProgress records
//!     ├── Compiler ──► CompileDiagnostic records
//!     ├── WorkerSupervisor (start if needed)
//!     └── WorkerHandle::submit ──► records relayed to subscribers ──► Finished
//! ```
//!
//! At most one run is in flight per coordinator. Separate documents use
//! separate coordinators and never wait on each other; they may share a
//! supervisor and a resolver.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::compile::{Compiler, SnippetCompiler};
use crate::config::{CoordinatorConfig, ScratchpadConfig};
use crate::error::{Error, Result};
use crate::ipc::{WorkerHandle, WorkerSupervisor};
use crate::packages::PackageResolver;
use crate::platform::Platform;
use crate::record::{Diagnostic, ResultRecord, RunEvent, RunOutcome};

use super::context::CancelToken;

/// Where the coordinator is in its run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Restoring packages and compiling.
    Resolving,
    /// The worker is executing.
    Running,
}

/// Per-document façade over resolver, compiler and worker.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    working_dir: PathBuf,
    config: CoordinatorConfig,
    supervisor: Arc<WorkerSupervisor>,
    resolver: Arc<PackageResolver>,
    compiler: Arc<dyn Compiler>,
    platform: Mutex<Platform>,
    state: watch::Sender<RunState>,
    cancel: CancelToken,
    /// Current worker of this document.
    worker: tokio::sync::Mutex<Option<Arc<WorkerHandle>>>,
    /// Worker executing the run in flight.
    active: Mutex<Option<Arc<WorkerHandle>>>,
    subscribers: Mutex<Vec<mpsc::Sender<RunEvent>>>,
    /// Serializes delivery so one run's terminal precedes the next run's records.
    relay: tokio::sync::Mutex<()>,
}

impl ExecutionCoordinator {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        supervisor: Arc<WorkerSupervisor>,
        resolver: Arc<PackageResolver>,
        compiler: Arc<dyn Compiler>,
        config: CoordinatorConfig,
    ) -> Self {
        let inner = Inner {
            working_dir: working_dir.into(),
            platform: Mutex::new(config.platform.clone()),
            config,
            supervisor,
            resolver,
            compiler,
            state: watch::Sender::new(RunState::Idle),
            cancel: CancelToken::new(),
            worker: tokio::sync::Mutex::new(None),
            active: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            relay: tokio::sync::Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Coordinator with real worker processes, the configured package
    /// cache and the built-in snippet compiler.
    pub fn from_config(config: &ScratchpadConfig, working_dir: impl Into<PathBuf>) -> Self {
        let supervisor = Arc::new(WorkerSupervisor::with_process_launcher(
            config.supervisor.clone(),
        ));
        let resolver = Arc::new(PackageResolver::from_config(&config.resolver));
        Self::new(
            working_dir,
            supervisor,
            resolver,
            Arc::new(SnippetCompiler::new()),
            config.coordinator.clone(),
        )
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() != RunState::Idle
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    pub fn platform(&self) -> Platform {
        self.inner.current_platform()
    }

    /// Receive every record and terminal from now on.
    ///
    /// The channel is bounded; a subscriber that stops reading stalls the
    /// run. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_buffer.max(1));
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Start a run of `source`.
    ///
    /// Fails immediately with [`Error::ExecutionAlreadyInProgress`] and no
    /// side effects unless the coordinator is idle. Progress is delivered to
    /// subscribers; the returned ticket resolves to the run's outcome.
    pub fn run(&self, source: impl Into<String>) -> Result<RunTicket> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Resolving;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::ExecutionAlreadyInProgress);
        }
        self.inner.cancel.reset();

        let inner = Arc::clone(&self.inner);
        let source = source.into();
        let task = tokio::spawn(async move {
            let outcome = inner.execute(source).await;
            tracing::info!(%outcome, "run finished");

            let _relay = inner.relay.lock().await;
            inner.state.send_replace(RunState::Idle);
            inner.broadcast(RunEvent::Finished(outcome.clone())).await;
            outcome
        });

        Ok(RunTicket { task })
    }

    /// Compile without executing and write the payload to `output_path`.
    ///
    /// Diagnostics are relayed to subscribers and returned. The worker is
    /// never involved.
    pub async fn compile_and_emit(&self, source: &str, output_path: &Path) -> Result<Vec<Diagnostic>> {
        let output = self.inner.compiler.compile(source);
        for diagnostic in &output.diagnostics {
            self.inner
                .publish(RunEvent::Record(ResultRecord::diagnostic(diagnostic.clone())))
                .await;
        }

        output.write_artifact(output_path)?;
        tracing::info!(path = %output_path.display(), "payload written");
        Ok(output.diagnostics)
    }

    /// Cancel the run in flight. No-op when idle.
    pub async fn cancel(&self) {
        self.inner.cancel_run().await;
    }

    /// Switch platforms. A live worker for another platform is shut down;
    /// the next run starts one for the new platform.
    pub async fn set_platform(&self, platform: Platform) {
        let changed = match self.inner.platform.lock() {
            Ok(mut current) => {
                if *current == platform {
                    false
                } else {
                    *current = platform.clone();
                    true
                }
            }
            Err(_) => false,
        };
        if !changed {
            return;
        }

        tracing::info!(platform = %platform, "platform changed");
        let old = self.inner.worker.lock().await.take();
        if let Some(old) = old {
            old.dispose().await;
        }
    }

    /// Cancel any run, terminate the worker and start a fresh one.
    pub async fn reset(&self) -> Result<()> {
        self.inner.cancel_run().await;

        let mut worker = self.inner.worker.lock().await;
        if let Some(old) = worker.take() {
            old.dispose().await;
        }
        let platform = self.inner.current_platform();
        let handle = self
            .inner
            .supervisor
            .start(&platform, &self.inner.working_dir)
            .await?;
        tracing::info!(generation = handle.generation(), "worker reset");
        *worker = Some(Arc::new(handle));
        Ok(())
    }

    /// Cancel any run and shut the worker down.
    pub async fn shutdown(&self) {
        self.inner.cancel_run().await;
        let old = self.inner.worker.lock().await.take();
        if let Some(old) = old {
            old.dispose().await;
        }
    }

    /// Generation of the current worker, if one is live.
    pub async fn worker_generation(&self) -> Option<u64> {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .filter(|handle| handle.is_alive())
            .map(|handle| handle.generation())
    }
}

impl Inner {
    fn current_platform(&self) -> Platform {
        match self.platform.lock() {
            Ok(platform) => platform.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active(&self, handle: Option<Arc<WorkerHandle>>) {
        if let Ok(mut active) = self.active.lock() {
            *active = handle;
        }
    }

    async fn cancel_run(&self) {
        let state = *self.state.borrow();
        if state == RunState::Idle {
            return;
        }
        tracing::info!(?state, "cancel requested");
        self.cancel.cancel();

        let active = self.active.lock().ok().and_then(|active| active.clone());
        if let Some(handle) = active {
            handle.cancel().await;
        }
    }

    async fn execute(self: &Arc<Self>, source: String) -> RunOutcome {
        // 1. Packages
        let directives = self.compiler.reference_directives(&source);
        let references = PackageResolver::extract_references(&directives);
        let mut package_paths = Vec::new();

        if !references.is_empty() {
            let (progress_tx, mut progress_rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
            let resolve = async move {
                self.resolver
                    .ensure_available(&references, &self.cancel, Some(&progress_tx))
                    .await
            };
            let relay = async {
                while let Some(record) = progress_rx.recv().await {
                    self.publish(RunEvent::Record(record)).await;
                }
            };
            let (resolved, ()) = tokio::join!(resolve, relay);

            match resolved {
                Ok(paths) => package_paths = paths,
                Err(Error::Canceled) => return RunOutcome::Canceled,
                Err(e) => {
                    let message = format!("Package restore failed: {}", e);
                    self.publish(RunEvent::Record(ResultRecord::restore(message, true)))
                        .await;
                    return RunOutcome::RestoreFailed;
                }
            }
        }
        if self.cancel.is_canceled() {
            return RunOutcome::Canceled;
        }

        // 2. Compile
        let output = self.compiler.compile(&source);
        for diagnostic in &output.diagnostics {
            self.publish(RunEvent::Record(ResultRecord::diagnostic(diagnostic.clone())))
                .await;
        }
        let payload = match output.into_payload() {
            Ok(payload) => payload,
            Err(_) => return RunOutcome::CompileFailed,
        };

        // 3. Worker
        let handle = match self.ensure_worker().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("failed to start worker: {}", e);
                let record = ResultRecord::exception(e.kind(), e.to_string(), None);
                self.publish(RunEvent::Record(record)).await;
                return RunOutcome::LaunchFailed;
            }
        };

        self.state.send_replace(RunState::Running);
        self.set_active(Some(Arc::clone(&handle)));
        if self.cancel.is_canceled() {
            self.set_active(None);
            return RunOutcome::Canceled;
        }

        // 4. Submit
        let mut stream = match handle.submit(payload, package_paths).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_active(None);
                tracing::warn!(generation = handle.generation(), "submit failed: {}", e);
                let record = ResultRecord::exception(e.kind(), e.to_string(), None);
                self.publish(RunEvent::Record(record)).await;
                self.discard_worker(&handle).await;
                return RunOutcome::Crashed {
                    message: e.to_string(),
                };
            }
        };

        // A cancel that raced the submit found the handle idle.
        if self.cancel.is_canceled() {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.cancel().await });
        }

        // 5. Relay
        let mut outcome = None;
        while let Some(event) = stream.next_event().await {
            match event {
                RunEvent::Record(record) => self.publish(RunEvent::Record(record)).await,
                RunEvent::Finished(finished) => outcome = Some(finished),
            }
        }
        self.set_active(None);

        // 6. A dead worker is replaced on the next run.
        if !handle.is_alive() {
            self.discard_worker(&handle).await;
        }

        outcome.unwrap_or_else(|| RunOutcome::Crashed {
            message: "run ended without a terminal".to_string(),
        })
    }

    async fn ensure_worker(&self) -> Result<Arc<WorkerHandle>> {
        let mut worker = self.worker.lock().await;

        if let Some(handle) = worker.as_ref() {
            if handle.is_alive() && !self.config.fresh_worker_per_run {
                return Ok(Arc::clone(handle));
            }
        }
        if let Some(old) = worker.take() {
            old.dispose().await;
        }

        let platform = self.current_platform();
        let handle = Arc::new(self.supervisor.start(&platform, &self.working_dir).await?);
        *worker = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop `handle` if it is still the current worker.
    async fn discard_worker(&self, handle: &Arc<WorkerHandle>) {
        let mut worker = self.worker.lock().await;
        let is_current = worker
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if is_current {
            tracing::info!(generation = handle.generation(), "discarding dead worker");
            worker.take();
        }
        drop(worker);
        handle.dispose().await;
    }

    async fn publish(&self, event: RunEvent) {
        let _relay = self.relay.lock().await;
        self.broadcast(event).await;
    }

    /// Deliver to every subscriber in turn. Callers hold `relay`.
    async fn broadcast(&self, event: RunEvent) {
        let subscribers: Vec<_> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };

        let mut closed = false;
        for subscriber in &subscribers {
            if subscriber.send(event.clone()).await.is_err() {
                closed = true;
            }
        }

        if closed {
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.retain(|subscriber| !subscriber.is_closed());
            }
        }
    }
}

/// Completion of a run started with [`ExecutionCoordinator::run`].
pub struct RunTicket {
    task: JoinHandle<RunOutcome>,
}

impl RunTicket {
    /// Wait for the run to finish.
    pub async fn outcome(self) -> RunOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Crashed {
                message: format!("run task failed: {}", e),
            },
        }
    }
}
