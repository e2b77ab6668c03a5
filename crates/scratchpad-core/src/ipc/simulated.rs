//! In-process worker simulation.
//!
//! [`SimulatedLauncher`] speaks the real worker protocol over in-memory pipes,
//! so supervisor and coordinator behavior can be exercised without building
//! or spawning the worker binary. What a simulated worker does for a payload
//! is scripted with [`Script`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf, split};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::record::ResultRecord;

use super::launcher::{LaunchRequest, WorkerConnection, WorkerLauncher, WorkerProcess};
use super::protocol::{WorkerCommand, WorkerMessage, read_frame, write_frame};

const PIPE_CAPACITY: usize = 64 * 1024;

/// One scripted action of a simulated run.
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit a record.
    Record(ResultRecord),
    /// Pause; a cancel request interrupts the pause.
    Sleep(Duration),
    /// Report `RunComplete`.
    Complete,
    /// Block forever without reporting anything.
    Hang,
    /// Exit the worker with the given code.
    Exit(i32),
    /// Report a fatal error and exit.
    Fatal(String),
}

/// Maps a payload to the steps the simulated worker performs for it.
#[derive(Clone)]
pub struct Script(Arc<dyn Fn(&[u8]) -> Vec<Step> + Send + Sync>);

impl Script {
    pub fn new(f: impl Fn(&[u8]) -> Vec<Step> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn steps(&self, payload: &[u8]) -> Vec<Step> {
        (self.0)(payload)
    }
}

/// Launches simulated workers on the current tokio runtime.
pub struct SimulatedLauncher {
    script: Script,
    handshake: bool,
    honor_cancel: bool,
    pipe_capacity: usize,
    fail_launch: AtomicBool,
    launches: Arc<AtomicUsize>,
    records_sent: Arc<AtomicUsize>,
    requests: Arc<std::sync::Mutex<Vec<LaunchRequest>>>,
}

impl SimulatedLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            handshake: true,
            honor_cancel: true,
            pipe_capacity: PIPE_CAPACITY,
            fail_launch: AtomicBool::new(false),
            launches: Arc::new(AtomicUsize::new(0)),
            records_sent: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Workers never send `Ready`.
    pub fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    /// Workers ignore `CancelRequest`.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    /// Bytes the pipe from worker to supervisor holds before writes block.
    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes.max(1);
        self
    }

    /// Make subsequent launches fail as if the runtime were missing.
    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Number of successful launches so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Records fully written to the pipe by all workers so far.
    pub fn records_sent(&self) -> usize {
        self.records_sent.load(Ordering::SeqCst)
    }

    /// Requests of all successful launches, oldest first.
    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl WorkerLauncher for SimulatedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<WorkerConnection> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::WorkerLaunch {
                platform: request.platform.short_id(),
                message: "simulated runtime is not installed".to_string(),
            });
        }

        let (supervisor_end, worker_end) = tokio::io::duplex(self.pipe_capacity);
        let (reader, writer) = split(supervisor_end);

        let pid = 10_000 + self.launches.fetch_add(1, Ordering::SeqCst) as u32;
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let worker = SimulatedWorker {
            script: self.script.clone(),
            handshake: self.handshake,
            honor_cancel: self.honor_cancel,
            records_sent: Arc::clone(&self.records_sent),
            channel: request.channel.clone(),
            pid,
        };
        let task = tokio::spawn(worker.run(worker_end));

        Ok(WorkerConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(SimulatedProcess {
                pid,
                task: Some(task),
                exit_code: None,
            }),
        })
    }
}

struct SimulatedWorker {
    script: Script,
    handshake: bool,
    honor_cancel: bool,
    records_sent: Arc<AtomicUsize>,
    channel: String,
    pid: u32,
}

type Output = Arc<Mutex<WriteHalf<DuplexStream>>>;

enum RunEnd {
    Finished,
    Exit(i32),
}

enum Event {
    RunEnded(RunEnd),
    Command(Option<WorkerCommand>),
}

/// Aborts the wrapped task when dropped, so a killed worker takes its
/// helpers down with it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SimulatedWorker {
    /// Returns the exit code.
    async fn run(self, stream: DuplexStream) -> i32 {
        let (mut input, output): (ReadHalf<DuplexStream>, _) = split(stream);
        let output: Output = Arc::new(Mutex::new(output));

        if !self.handshake {
            std::future::pending::<()>().await;
        }
        let ready = WorkerMessage::Ready {
            channel: self.channel.clone(),
            pid: self.pid,
        };
        if send(&output, &ready).await.is_err() {
            return 1;
        }

        // Frames are read on their own task so a half-read command is never
        // lost to a select.
        let (command_tx, mut commands) = mpsc::channel(16);
        let _reader = AbortOnDrop(tokio::spawn(async move {
            while let Ok(Some(command)) = read_frame::<_, WorkerCommand>(&mut input).await {
                if command_tx.send(command).await.is_err() {
                    break;
                }
            }
        }));

        let mut current: Option<(BoxFuture<'static, RunEnd>, Arc<Notify>)> = None;

        loop {
            let event = match current.as_mut() {
                Some((run, _)) => tokio::select! {
                    end = run => Event::RunEnded(end),
                    command = commands.recv() => Event::Command(command),
                },
                None => Event::Command(commands.recv().await),
            };

            match event {
                Event::RunEnded(RunEnd::Finished) => current = None,
                Event::RunEnded(RunEnd::Exit(code)) => return code,
                Event::Command(Some(WorkerCommand::RunRequest { payload, .. })) => {
                    let steps = self.script.steps(&payload);
                    let cancel = Arc::new(Notify::new());
                    let run = Box::pin(play(
                        steps,
                        Arc::clone(&output),
                        Arc::clone(&cancel),
                        Arc::clone(&self.records_sent),
                    ));
                    current = Some((run, cancel));
                }
                Event::Command(Some(WorkerCommand::CancelRequest)) => {
                    if let Some((_, cancel)) = &current {
                        if self.honor_cancel {
                            cancel.notify_one();
                        }
                    }
                }
                Event::Command(Some(WorkerCommand::Shutdown)) | Event::Command(None) => return 0,
            }
        }
    }
}

async fn play(
    steps: Vec<Step>,
    output: Output,
    cancel: Arc<Notify>,
    records_sent: Arc<AtomicUsize>,
) -> RunEnd {
    for step in steps {
        let interrupted = match step {
            Step::Record(record) => {
                if send(&output, &WorkerMessage::Record { record }).await.is_err() {
                    return RunEnd::Exit(1);
                }
                records_sent.fetch_add(1, Ordering::SeqCst);
                false
            }
            Step::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => false,
                    _ = cancel.notified() => true,
                }
            }
            Step::Complete => {
                let _ = send(&output, &WorkerMessage::RunComplete).await;
                return RunEnd::Finished;
            }
            Step::Hang => {
                cancel.notified().await;
                true
            }
            Step::Exit(code) => return RunEnd::Exit(code),
            Step::Fatal(message) => {
                let _ = send(&output, &WorkerMessage::FatalError { message }).await;
                return RunEnd::Exit(1);
            }
        };
        if interrupted {
            let _ = send(&output, &WorkerMessage::RunCanceled).await;
            return RunEnd::Finished;
        }
    }
    let _ = send(&output, &WorkerMessage::RunComplete).await;
    RunEnd::Finished
}

async fn send(output: &Output, message: &WorkerMessage) -> Result<()> {
    let mut output = output.lock().await;
    write_frame(&mut *output, message).await
}

struct SimulatedProcess {
    pid: u32,
    task: Option<JoinHandle<i32>>,
    exit_code: Option<i32>,
}

impl WorkerProcess for SimulatedProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if let Some(task) = self.task.take() {
                task.abort();
                if let Ok(code) = task.await {
                    self.exit_code = Some(code);
                }
            }
            Ok(())
        })
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<Option<i32>>> {
        Box::pin(async move {
            if let Some(task) = self.task.take() {
                self.exit_code = task.await.ok();
            }
            Ok(self.exit_code)
        })
    }
}

impl Drop for SimulatedProcess {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
