//! Scratchpad worker process.
//!
//! Executes compiled snippets in isolation from the host. Commands arrive as
//! framed messages on stdin, results leave as framed messages on stdout, and
//! logs go to stderr.
//!
//! Lifecycle:
//! 1. Change into `--working-dir` and send `Ready` with the `--channel` id
//! 2. Serve `RunRequest`s one at a time on a dedicated thread
//! 3. `CancelRequest` stops the current run at the next statement boundary
//! 4. `Shutdown` or end of input exits with code 0

mod interpreter;

use std::any::Any;
use std::io::{self, BufReader, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use clap::Parser;
use scratchpad_core::compile::Program;
use scratchpad_core::ipc::protocol::{WorkerCommand, WorkerMessage, read_message, write_message};
use scratchpad_core::record::ResultRecord;

use interpreter::{Interpreter, RunEnd};

/// Environment variable controlling worker log output.
const LOG_ENV: &str = "SCRATCHPAD_WORKER_LOG";

#[derive(Parser)]
#[command(name = "scratchpad-worker")]
#[command(about = "Isolated execution worker for scratchpad snippets")]
#[command(version)]
struct Args {
    /// Directory the snippet runs in
    #[arg(long)]
    working_dir: PathBuf,

    /// Channel id to echo in the Ready handshake
    #[arg(long)]
    channel: String,
}

type Output = Arc<Mutex<Box<dyn Write + Send>>>;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let output: Output = Arc::new(Mutex::new(Box::new(BufWriter::new(io::stdout()))));

    if let Err(e) = std::env::set_current_dir(&args.working_dir) {
        let message = format!(
            "cannot enter working directory {}: {}",
            args.working_dir.display(),
            e
        );
        send(&output, &WorkerMessage::FatalError { message: message.clone() })?;
        anyhow::bail!(message);
    }

    send(
        &output,
        &WorkerMessage::Ready {
            channel: args.channel.clone(),
            pid: std::process::id(),
        },
    )
    .context("Failed to send Ready")?;
    tracing::info!(pid = std::process::id(), "worker ready");

    serve(output)
}

/// Command loop. Returns on `Shutdown` or end of input.
fn serve(output: Output) -> anyhow::Result<()> {
    let interpreter = Arc::new(Mutex::new(Interpreter::new()));
    let abort = Arc::new(AtomicBool::new(false));
    let mut current: Option<JoinHandle<()>> = None;
    let mut input = BufReader::new(io::stdin().lock());

    loop {
        let command = match read_message::<_, WorkerCommand>(&mut input) {
            Ok(Some(command)) => command,
            Ok(None) => {
                tracing::debug!("input closed");
                abort.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(e) => {
                tracing::error!("failed to read command: {}", e);
                let _ = send(&output, &WorkerMessage::FatalError { message: e.to_string() });
                std::process::exit(1);
            }
        };

        match command {
            WorkerCommand::RunRequest {
                payload,
                package_paths,
            } => {
                // The supervisor never overlaps runs; wait out a straggler.
                if let Some(previous) = current.take() {
                    let _ = previous.join();
                }
                abort.store(false, Ordering::SeqCst);

                let interpreter = Arc::clone(&interpreter);
                let abort = Arc::clone(&abort);
                let output = Arc::clone(&output);
                current = Some(thread::spawn(move || {
                    run_guarded(&output, || {
                        execute(&interpreter, &payload, &package_paths, &abort, &output)
                    })
                }));
            }
            WorkerCommand::CancelRequest => {
                tracing::debug!("cancel requested");
                abort.store(true, Ordering::SeqCst);
            }
            WorkerCommand::Shutdown => {
                tracing::debug!("shutdown requested");
                abort.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
    }
}

/// Run one payload and report its terminal. Exits the process when the
/// supervisor can no longer be reached or the script calls `exit`.
fn execute(
    interpreter: &Mutex<Interpreter>,
    payload: &[u8],
    package_paths: &[PathBuf],
    abort: &AtomicBool,
    output: &Output,
) {
    let program = match Program::from_payload(payload) {
        Ok(program) => program,
        Err(e) => {
            let record = ResultRecord::exception("PayloadError", e.to_string(), None);
            report(output, &WorkerMessage::Record { record });
            report(output, &WorkerMessage::RunComplete);
            return;
        }
    };

    let mut interpreter = match interpreter.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    tracing::debug!(statements = program.statements.len(), "running program");

    let mut emit = |record: ResultRecord| -> io::Result<()> {
        send(output, &WorkerMessage::Record { record }).map_err(io::Error::other)
    };
    let end = match interpreter.run(&program, package_paths, abort, &mut emit) {
        Ok(end) => end,
        Err(e) => {
            tracing::error!("lost connection to supervisor: {}", e);
            std::process::exit(1);
        }
    };

    match end {
        RunEnd::Completed => report(output, &WorkerMessage::RunComplete),
        RunEnd::Canceled => report(output, &WorkerMessage::RunCanceled),
        RunEnd::Exit(code) => {
            tracing::info!(code, "script requested exit");
            if let Ok(mut out) = output.lock() {
                let _ = out.flush();
            }
            std::process::exit(code);
        }
    }
}

/// Run `run`, closing out the run with one `Exception` and `RunComplete` if
/// it panics.
fn run_guarded(output: &Output, run: impl FnOnce()) {
    if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(run)) {
        report_panic(output, cause.as_ref());
    }
}

fn report_panic(output: &Output, cause: &(dyn Any + Send)) {
    let message = cause
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| cause.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("run panicked: {}", message);

    let record = ResultRecord::exception("InternalError", format!("worker panicked: {}", message), None);
    report(output, &WorkerMessage::Record { record });
    report(output, &WorkerMessage::RunComplete);
}

fn report(output: &Output, message: &WorkerMessage) {
    if let Err(e) = send(output, message) {
        tracing::error!("lost connection to supervisor: {}", e);
        std::process::exit(1);
    }
}

fn send(output: &Output, message: &WorkerMessage) -> scratchpad_core::Result<()> {
    let mut out = match output.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    write_message(&mut *out, message)
}
