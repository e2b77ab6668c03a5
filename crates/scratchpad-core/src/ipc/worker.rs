//! Worker supervision.
//!
//! [`WorkerSupervisor`] starts workers and hands out [`WorkerHandle`]s. Each
//! handle owns one worker process and a pump task that reads the worker's
//! output channel and forwards it to the run in flight.
//!
//! Every hop between the worker and a consumer is a bounded channel. A slow
//! consumer stalls the pump, the pump stops reading, and the worker blocks on
//! its own writes; nothing is dropped.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Notify, mpsc, watch};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::record::{ResultRecord, RunEvent, RunOutcome};

use super::launcher::{
    LaunchRequest, ProcessLauncher, WorkerConnection, WorkerLauncher, WorkerProcess, WorkerReader,
    WorkerWriter,
};
use super::protocol::{WorkerCommand, WorkerMessage, read_frame, write_frame};

/// Exception type reported when a worker dies mid-run.
pub const WORKER_CRASHED: &str = "WorkerCrashed";

/// Starts and restarts workers.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    generation: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Supervisor launching real `scratchpad-worker` processes.
    pub fn with_process_launcher(config: SupervisorConfig) -> Self {
        let launcher = ProcessLauncher::new(config.worker_path.clone());
        Self::new(Arc::new(launcher), config)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch a worker and wait for its `Ready` handshake.
    pub async fn start(&self, platform: &Platform, working_dir: &Path) -> Result<WorkerHandle> {
        let channel = Uuid::new_v4().to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let request = LaunchRequest {
            platform: platform.clone(),
            working_dir: working_dir.to_path_buf(),
            channel: channel.clone(),
        };
        let WorkerConnection {
            mut reader,
            writer,
            mut process,
        } = self.launcher.launch(&request)?;

        let pid = match handshake(&mut reader, process.as_mut(), &channel, platform, &self.config).await {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(kill_err) = process.kill().await {
                    tracing::debug!("failed to kill worker after handshake error: {}", kill_err);
                }
                return Err(e);
            }
        };

        tracing::info!(generation, pid, platform = %platform, "worker ready");

        let shared = Arc::new(Shared::new(generation, pid));
        tokio::spawn(pump(
            Arc::clone(&shared),
            reader,
            process,
            self.config.shutdown_grace,
        ));

        Ok(WorkerHandle {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            platform: platform.clone(),
            working_dir: working_dir.to_path_buf(),
            config: self.config.clone(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Dispose `handle` and start a replacement with the same platform and
    /// working directory.
    pub async fn reset(&self, handle: &WorkerHandle) -> Result<WorkerHandle> {
        handle.dispose().await;
        self.start(&handle.platform, &handle.working_dir).await
    }
}

async fn handshake(
    reader: &mut WorkerReader,
    process: &mut dyn WorkerProcess,
    channel: &str,
    platform: &Platform,
    config: &SupervisorConfig,
) -> Result<u32> {
    let first = tokio::time::timeout(
        config.handshake_timeout,
        read_frame::<_, WorkerMessage>(reader),
    )
    .await
    .map_err(|_| Error::HandshakeTimeout(config.handshake_timeout))?;

    match first {
        Ok(Some(WorkerMessage::Ready { channel: echoed, pid })) => {
            if echoed == channel {
                Ok(pid)
            } else {
                Err(Error::Protocol(format!(
                    "worker answered on channel '{}', expected '{}'",
                    echoed, channel
                )))
            }
        }
        Ok(Some(WorkerMessage::FatalError { message })) => Err(Error::WorkerLaunch {
            platform: platform.short_id(),
            message,
        }),
        Ok(Some(other)) => Err(Error::Protocol(format!(
            "expected Ready from worker, got {:?}",
            other
        ))),
        Ok(None) => {
            let code = tokio::time::timeout(config.shutdown_grace, process.wait())
                .await
                .ok()
                .and_then(|r| r.ok())
                .flatten();
            Err(Error::WorkerLaunch {
                platform: platform.short_id(),
                message: match code {
                    Some(code) => format!("worker exited with code {} before becoming ready", code),
                    None => "worker exited before becoming ready".to_string(),
                },
            })
        }
        Err(e) => Err(Error::WorkerLaunch {
            platform: platform.short_id(),
            message: e.to_string(),
        }),
    }
}

/// State shared between a handle and its pump.
struct Shared {
    generation: u64,
    pid: u32,
    /// Sink of the run in flight.
    sink: Mutex<Option<mpsc::Sender<RunEvent>>>,
    running: watch::Sender<bool>,
    alive: watch::Sender<bool>,
    cancel_requested: AtomicBool,
    kill: Notify,
}

impl Shared {
    fn new(generation: u64, pid: u32) -> Self {
        Self {
            generation,
            pid,
            sink: Mutex::new(None),
            running: watch::Sender::new(false),
            alive: watch::Sender::new(true),
            cancel_requested: AtomicBool::new(false),
            kill: Notify::new(),
        }
    }

    fn current_sink(&self) -> Option<mpsc::Sender<RunEvent>> {
        self.sink.lock().ok().and_then(|sink| sink.clone())
    }

    fn take_sink(&self) -> Option<mpsc::Sender<RunEvent>> {
        self.sink.lock().ok().and_then(|mut sink| sink.take())
    }

    /// End the run in flight. The handle is marked idle before the terminal
    /// is delivered so a consumer reacting to it can submit again.
    async fn finish(&self, outcome: RunOutcome) {
        let sink = self.take_sink();
        self.running.send_replace(false);
        match sink {
            Some(tx) => {
                let _ = tx.send(RunEvent::Finished(outcome)).await;
            }
            None => tracing::warn!(generation = self.generation, "run terminal without a run in flight"),
        }
    }
}

enum PumpEnd {
    Eof,
    Killed,
    Broken(String),
}

async fn pump(
    shared: Arc<Shared>,
    mut reader: WorkerReader,
    mut process: Box<dyn WorkerProcess>,
    exit_grace: Duration,
) {
    let end = loop {
        let frame = tokio::select! {
            biased;
            _ = shared.kill.notified() => break PumpEnd::Killed,
            frame = read_frame::<_, WorkerMessage>(&mut reader) => frame,
        };

        match frame {
            Ok(Some(WorkerMessage::Record { record })) => match shared.current_sink() {
                Some(tx) => {
                    tokio::select! {
                        biased;
                        _ = shared.kill.notified() => break PumpEnd::Killed,
                        // A dropped consumer is not an error; the run continues.
                        _ = tx.send(RunEvent::Record(record)) => {}
                    }
                }
                None => tracing::warn!(
                    generation = shared.generation,
                    "discarding record received outside of a run"
                ),
            },
            Ok(Some(WorkerMessage::RunComplete)) => shared.finish(RunOutcome::Completed).await,
            Ok(Some(WorkerMessage::RunCanceled)) => shared.finish(RunOutcome::Canceled).await,
            Ok(Some(WorkerMessage::FatalError { message })) => break PumpEnd::Broken(message),
            Ok(Some(WorkerMessage::Ready { .. })) => {
                break PumpEnd::Broken("worker sent a second Ready".to_string());
            }
            Ok(None) => break PumpEnd::Eof,
            Err(e) => break PumpEnd::Broken(e.to_string()),
        }
    };

    let exit_code = match end {
        PumpEnd::Eof => match tokio::time::timeout(exit_grace, process.wait()).await {
            Ok(Ok(code)) => code,
            _ => {
                kill_process(process.as_mut(), shared.generation).await;
                None
            }
        },
        PumpEnd::Killed | PumpEnd::Broken(_) => {
            kill_process(process.as_mut(), shared.generation).await;
            None
        }
    };
    drop(reader);

    // Mark dead under the sink lock so `submit` cannot install a sink that
    // nobody will ever finish.
    let sink = match shared.sink.lock() {
        Ok(mut sink) => {
            shared.alive.send_replace(false);
            sink.take()
        }
        Err(_) => {
            shared.alive.send_replace(false);
            None
        }
    };
    shared.running.send_replace(false);

    let canceled = shared.cancel_requested.load(Ordering::SeqCst);
    tracing::debug!(
        generation = shared.generation,
        pid = shared.pid,
        ?exit_code,
        canceled,
        "worker terminated"
    );

    let Some(tx) = sink else {
        return;
    };

    if canceled {
        let _ = tx.send(RunEvent::Finished(RunOutcome::Canceled)).await;
        return;
    }

    let message = match (&end, exit_code) {
        (PumpEnd::Broken(reason), _) => format!("worker failed: {}", reason),
        (_, Some(code)) => format!("worker exited unexpectedly with code {}", code),
        (_, None) => "worker exited unexpectedly".to_string(),
    };
    tracing::warn!(generation = shared.generation, pid = shared.pid, "{}", message);

    let record = ResultRecord::exception(WORKER_CRASHED, message.clone(), None);
    let _ = tx.send(RunEvent::Record(record)).await;
    let _ = tx.send(RunEvent::Finished(RunOutcome::Crashed { message })).await;
}

async fn kill_process(process: &mut dyn WorkerProcess, generation: u64) {
    if let Err(e) = process.kill().await {
        tracing::debug!(generation, "failed to kill worker: {}", e);
    }
}

/// Handle to one live worker process.
pub struct WorkerHandle {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WorkerWriter>,
    platform: Platform,
    working_dir: PathBuf,
    config: SupervisorConfig,
    disposed: AtomicBool,
}

impl WorkerHandle {
    /// Monotonic id of this worker among all workers of its supervisor.
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Whether the worker process is still connected.
    pub fn is_alive(&self) -> bool {
        *self.shared.alive.borrow()
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Send a payload for execution.
    ///
    /// The returned stream yields the run's records in emission order followed
    /// by exactly one [`RunEvent::Finished`]. Fails with
    /// [`Error::ExecutionAlreadyInProgress`] while another run is in flight.
    pub async fn submit(&self, payload: Vec<u8>, package_paths: Vec<PathBuf>) -> Result<RunStream> {
        let claimed = self.shared.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                self.shared.cancel_requested.store(false, Ordering::SeqCst);
                *running = true;
                true
            }
        });
        if !claimed {
            return Err(Error::ExecutionAlreadyInProgress);
        }

        let (tx, rx) = mpsc::channel(self.config.record_buffer.max(1));
        {
            let mut sink = self
                .shared
                .sink
                .lock()
                .map_err(|_| Error::Transport("worker state poisoned".to_string()))?;
            if !self.is_alive() {
                drop(sink);
                self.shared.running.send_replace(false);
                return Err(Error::Transport("worker is no longer running".to_string()));
            }
            *sink = Some(tx);
        }

        tracing::debug!(
            generation = self.shared.generation,
            payload_len = payload.len(),
            packages = package_paths.len(),
            "submitting run"
        );

        let command = WorkerCommand::RunRequest {
            payload,
            package_paths,
        };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &command).await
        };
        if let Err(e) = written {
            // The pump reports the crash on the stream once the process is gone.
            tracing::warn!(generation = self.shared.generation, "failed to submit run: {}", e);
            self.shared.kill.notify_one();
        }

        Ok(RunStream::new(rx))
    }

    /// Cancel the run in flight, if any.
    ///
    /// Asks the worker to stop cooperatively and kills it if the run has not
    /// ended within the cancel grace period. Either way the run's stream ends
    /// with [`RunOutcome::Canceled`].
    pub async fn cancel(&self) {
        if !self.is_running() {
            return;
        }
        self.shared.cancel_requested.store(true, Ordering::SeqCst);
        tracing::info!(generation = self.shared.generation, "canceling run");

        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &WorkerCommand::CancelRequest).await
        };

        let stopped = match sent {
            Ok(()) => {
                let mut running = self.shared.running.subscribe();
                tokio::time::timeout(self.config.cancel_grace, running.wait_for(|r| !*r))
                    .await
                    .is_ok()
            }
            Err(e) => {
                tracing::debug!("failed to send cancel request: {}", e);
                false
            }
        };

        if !stopped {
            tracing::warn!(
                generation = self.shared.generation,
                "worker did not stop within {:?}; killing it",
                self.config.cancel_grace
            );
            self.shared.kill.notify_one();
            self.wait_terminated().await;
        }
    }

    /// Shut the worker down and release its resources.
    ///
    /// Idempotent. A run still in flight ends with [`RunOutcome::Canceled`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            self.wait_terminated().await;
            return;
        }

        if self.is_running() {
            self.shared.cancel_requested.store(true, Ordering::SeqCst);
        }

        if self.is_alive() {
            let sent = {
                let mut writer = self.writer.lock().await;
                write_frame(&mut *writer, &WorkerCommand::Shutdown).await
            };
            let mut alive = self.shared.alive.subscribe();
            let exited = sent.is_ok()
                && tokio::time::timeout(self.config.shutdown_grace, alive.wait_for(|a| !*a))
                    .await
                    .is_ok();
            if !exited {
                self.shared.kill.notify_one();
            }
        }
        self.wait_terminated().await;

        tracing::debug!(generation = self.shared.generation, "worker disposed");
    }

    async fn wait_terminated(&self) {
        let mut alive = self.shared.alive.subscribe();
        let _ = alive.wait_for(|a| !*a).await;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            self.shared.kill.notify_one();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("generation", &self.shared.generation)
            .field("pid", &self.shared.pid)
            .field("platform", &self.platform)
            .field("alive", &self.is_alive())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Ordered stream of one run's events.
///
/// Yields records, then exactly one [`RunEvent::Finished`], then ends.
pub struct RunStream {
    rx: mpsc::Receiver<RunEvent>,
    finished: bool,
}

impl RunStream {
    fn new(rx: mpsc::Receiver<RunEvent>) -> Self {
        Self {
            rx,
            finished: false,
        }
    }

    fn observe(&mut self, event: Option<RunEvent>) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        match event {
            Some(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            None => {
                self.finished = true;
                Some(RunEvent::Finished(RunOutcome::Crashed {
                    message: "worker channel closed without a terminal".to_string(),
                }))
            }
        }
    }

    /// Next event of the run, or `None` once the terminal has been yielded.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        self.observe(event)
    }

    /// Drain the run, returning its records and outcome.
    pub async fn collect_all(mut self) -> (Vec<ResultRecord>, RunOutcome) {
        let mut records = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                RunEvent::Record(record) => records.push(record),
                RunEvent::Finished(outcome) => return (records, outcome),
            }
        }
        (
            records,
            RunOutcome::Crashed {
                message: "run stream ended without a terminal".to_string(),
            },
        )
    }
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(self.observe(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}
