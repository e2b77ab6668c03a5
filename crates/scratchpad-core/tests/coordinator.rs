//! Integration tests for the execution coordinator.
//!
//! Workers are simulated in-process; their scripts interpret the compiled
//! program just far enough to produce deterministic records.

use std::sync::Arc;
use std::time::Duration;

use scratchpad_core::compile::{BinOp, Expr, Program, SnippetCompiler, StatementKind};
use scratchpad_core::config::{CoordinatorConfig, SupervisorConfig};
use scratchpad_core::ipc::WORKER_CRASHED;
use scratchpad_core::ipc::simulated::{Script, SimulatedLauncher, Step};
use scratchpad_core::packages::{NoPackageSource, PackageCache, PackageResolver};
use scratchpad_core::platform::{Architecture, Platform, RuntimeKind};
use scratchpad_core::{Error, ExecutionCoordinator, ResultRecord, RunEvent, RunOutcome, RunState, WorkerSupervisor};
use tempfile::TempDir;
use tokio::sync::mpsc;

// =============================================================================
// Test Helpers
// =============================================================================

fn eval(expr: &Expr) -> i64 {
    match expr {
        Expr::Int(n) => *n,
        Expr::Neg(inner) => -eval(inner),
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::Add => eval(lhs) + eval(rhs),
            BinOp::Sub => eval(lhs) - eval(rhs),
            BinOp::Mul => eval(lhs) * eval(rhs),
            BinOp::Div => eval(lhs) / eval(rhs),
        },
        other => panic!("unsupported expression in test script: {:?}", other),
    }
}

/// Handles integer `print`, `sleep` and `exit`.
fn program_script() -> Script {
    Script::new(|payload: &[u8]| {
        let program = Program::from_payload(payload).expect("payload should decode");
        let mut steps = Vec::new();
        for statement in program.statements {
            match statement.kind {
                StatementKind::Print { value } => {
                    steps.push(Step::Record(ResultRecord::value(eval(&value).to_string())));
                }
                StatementKind::Sleep { millis } => {
                    steps.push(Step::Sleep(Duration::from_millis(eval(&millis) as u64)));
                }
                StatementKind::Exit { code } => steps.push(Step::Exit(eval(&code) as i32)),
                _ => {}
            }
        }
        steps.push(Step::Complete);
        steps
    })
}

struct Fixture {
    coordinator: ExecutionCoordinator,
    launcher: Arc<SimulatedLauncher>,
    temp: TempDir,
}

impl Fixture {
    fn new(launcher: SimulatedLauncher) -> Self {
        Self::with_config(launcher, supervisor_config(), CoordinatorConfig::default())
    }

    fn with_config(
        launcher: SimulatedLauncher,
        supervisor: SupervisorConfig,
        config: CoordinatorConfig,
    ) -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let launcher = Arc::new(launcher);
        let supervisor = Arc::new(WorkerSupervisor::new(launcher.clone(), supervisor));
        let resolver = Arc::new(PackageResolver::new(
            PackageCache::new(temp.path().join("packages")),
            Arc::new(NoPackageSource),
        ));
        let coordinator = ExecutionCoordinator::new(
            temp.path(),
            supervisor,
            resolver,
            Arc::new(SnippetCompiler::new()),
            config,
        );

        Self {
            coordinator,
            launcher,
            temp,
        }
    }

    fn simple() -> Self {
        Self::new(SimulatedLauncher::new(program_script()))
    }
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        handshake_timeout: Duration::from_millis(500),
        cancel_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(200),
        ..SupervisorConfig::default()
    }
}

/// Events up to and including the first terminal.
async fn drain(rx: &mut mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn records(events: &[RunEvent]) -> Vec<&ResultRecord> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::Record(record) => Some(record),
            RunEvent::Finished(_) => None,
        })
        .collect()
}

async fn wait_for_state(coordinator: &ExecutionCoordinator, state: RunState) {
    let mut watch = coordinator.watch_state();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

// =============================================================================
// Run Tests
// =============================================================================

#[tokio::test]
async fn test_print_then_completed() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1+1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);

    let events = drain(&mut rx).await;
    assert_eq!(
        events,
        vec![
            RunEvent::Record(ResultRecord::value("2")),
            RunEvent::Finished(RunOutcome::Completed),
        ]
    );
    assert_eq!(fixture.coordinator.state(), RunState::Idle);
}

#[tokio::test]
async fn test_record_order_is_preserved() {
    for count in [0usize, 1, 50] {
        let fixture = Fixture::simple();
        let mut rx = fixture.coordinator.subscribe();

        let source: Vec<String> = (0..count).map(|i| format!("print({})", i)).collect();
        let ticket = fixture.coordinator.run(source.join("\n")).unwrap();
        assert_eq!(ticket.outcome().await, RunOutcome::Completed);

        let events = drain(&mut rx).await;
        assert_eq!(events.len(), count + 1);
        let texts: Vec<String> = records(&events).iter().map(|r| r.to_string()).collect();
        let expected: Vec<String> = (0..count).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
        assert_eq!(events.last(), Some(&RunEvent::Finished(RunOutcome::Completed)));
    }
}

#[tokio::test]
async fn test_slow_subscriber_stalls_the_worker() {
    const RECORDS: usize = 200;
    const BUFFER: usize = 4;

    let launcher = SimulatedLauncher::new(program_script()).with_pipe_capacity(64);
    let fixture = Fixture::with_config(
        launcher,
        SupervisorConfig {
            record_buffer: BUFFER,
            ..supervisor_config()
        },
        CoordinatorConfig {
            subscriber_buffer: BUFFER,
            ..CoordinatorConfig::default()
        },
    );
    let mut rx = fixture.coordinator.subscribe();

    let source: Vec<String> = (0..RECORDS).map(|i| format!("print({})", i)).collect();
    let ticket = fixture.coordinator.run(source.join("\n")).unwrap();
    wait_for_state(&fixture.coordinator, RunState::Running).await;

    // Nobody reads: the worker stops once every buffer on the way is full.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stalled = fixture.launcher.records_sent();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.launcher.records_sent(), stalled);
    assert!(
        stalled <= 2 * BUFFER + 4,
        "worker sent {} records past a full subscriber",
        stalled
    );
    assert!(fixture.coordinator.is_running());

    let events = drain(&mut rx).await;
    let texts: Vec<String> = records(&events).iter().map(|r| r.to_string()).collect();
    let expected: Vec<String> = (0..RECORDS).map(|i| i.to_string()).collect();
    assert_eq!(texts, expected);
    assert_eq!(events.last(), Some(&RunEvent::Finished(RunOutcome::Completed)));
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(fixture.launcher.records_sent(), RECORDS);
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let first = fixture.coordinator.run("sleep(300)\nprint(1)").unwrap();
    let second = fixture.coordinator.run("print(2)");
    assert!(matches!(second, Err(Error::ExecutionAlreadyInProgress)));

    assert_eq!(first.outcome().await, RunOutcome::Completed);
    let events = drain(&mut rx).await;
    assert_eq!(records(&events).len(), 1);
    assert_eq!(records(&events)[0].to_string(), "1");

    // Idle again; the next run is accepted.
    let third = fixture.coordinator.run("print(3)").unwrap();
    assert_eq!(third.outcome().await, RunOutcome::Completed);
}

#[tokio::test]
async fn test_worker_is_reused_between_runs() {
    let fixture = Fixture::simple();

    for _ in 0..3 {
        let ticket = fixture.coordinator.run("print(1)").unwrap();
        assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    }
    assert_eq!(fixture.launcher.launches(), 1);
    assert!(fixture.coordinator.worker_generation().await.is_some());
}

#[tokio::test]
async fn test_state_passes_through_running() {
    let fixture = Fixture::simple();
    let ticket = fixture.coordinator.run("sleep(200)").unwrap();

    wait_for_state(&fixture.coordinator, RunState::Running).await;
    assert!(fixture.coordinator.is_running());

    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(fixture.coordinator.state(), RunState::Idle);
}

// =============================================================================
// Cancel Tests
// =============================================================================

#[tokio::test]
async fn test_cancel_yields_single_terminal() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1)\nsleep(30000)\nprint(2)").unwrap();
    wait_for_state(&fixture.coordinator, RunState::Running).await;
    fixture.coordinator.cancel().await;

    assert_eq!(ticket.outcome().await, RunOutcome::Canceled);
    let events = drain(&mut rx).await;
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events.last(), Some(&RunEvent::Finished(RunOutcome::Canceled)));
    assert!(records(&events).iter().all(|r| r.to_string() != "2"));

    // A cooperative cancel keeps the worker.
    let ticket = fixture.coordinator.run("print(5)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(fixture.launcher.launches(), 1);
}

#[tokio::test]
async fn test_ignored_cancel_kills_and_replaces_worker() {
    let fixture = Fixture::new(SimulatedLauncher::new(program_script()).ignoring_cancel());
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("sleep(30000)").unwrap();
    wait_for_state(&fixture.coordinator, RunState::Running).await;
    let first = fixture.coordinator.worker_generation().await;

    tokio::time::timeout(Duration::from_secs(5), fixture.coordinator.cancel())
        .await
        .expect("cancel should escalate to a kill");
    assert_eq!(ticket.outcome().await, RunOutcome::Canceled);

    let events = drain(&mut rx).await;
    assert_eq!(events, vec![RunEvent::Finished(RunOutcome::Canceled)]);

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(fixture.launcher.launches(), 2);
    assert_ne!(fixture.coordinator.worker_generation().await, first);
}

#[tokio::test]
async fn test_cancel_when_idle_is_noop() {
    let fixture = Fixture::simple();
    fixture.coordinator.cancel().await;
    assert_eq!(fixture.coordinator.state(), RunState::Idle);

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_crash_reports_exception_and_recovers() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1)\nexit(3)").unwrap();
    let outcome = ticket.outcome().await;
    assert!(matches!(outcome, RunOutcome::Crashed { .. }));

    let events = drain(&mut rx).await;
    let crash: Vec<_> = records(&events)
        .into_iter()
        .filter(|r| matches!(r, ResultRecord::Exception { exception_type, .. } if exception_type == WORKER_CRASHED))
        .collect();
    assert_eq!(crash.len(), 1);
    assert!(matches!(events.last(), Some(RunEvent::Finished(RunOutcome::Crashed { .. }))));

    let ticket = fixture.coordinator.run("print(1+1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(fixture.launcher.launches(), 2);
}

#[tokio::test]
async fn test_compile_failure_never_launches() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1 +)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::CompileFailed);

    let events = drain(&mut rx).await;
    let diagnostics = records(&events);
    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(diagnostics[0], ResultRecord::CompileDiagnostic(d) if d.is_error()));
    assert_eq!(fixture.launcher.launches(), 0);
}

#[tokio::test]
async fn test_warnings_do_not_block_the_run() {
    let fixture = Fixture::simple();
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("1 + 1\nprint(4)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);

    let events = drain(&mut rx).await;
    let records = records(&events);
    assert!(matches!(records[0], ResultRecord::CompileDiagnostic(d) if !d.is_error()));
    assert_eq!(records[1], &ResultRecord::value("4"));
}

#[tokio::test]
async fn test_launch_failure() {
    let fixture = Fixture::simple();
    fixture.launcher.set_fail_launch(true);
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::LaunchFailed);

    let events = drain(&mut rx).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        RunEvent::Record(ResultRecord::Exception { exception_type, .. }) if exception_type == "WorkerLaunchError"
    ));

    // The coordinator is usable once the runtime is back.
    fixture.launcher.set_fail_launch(false);
    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
}

#[tokio::test]
async fn test_handshake_timeout_is_launch_failure() {
    let fixture = Fixture::new(SimulatedLauncher::new(program_script()).without_handshake());

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::LaunchFailed);
    assert_eq!(fixture.coordinator.state(), RunState::Idle);
}

// =============================================================================
// Worker Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_set_platform_restarts_worker() {
    let fixture = Fixture::simple();
    let ticket = fixture.coordinator.run("print(1)").unwrap();
    ticket.outcome().await;

    let other = Platform::new(Architecture::X86, RuntimeKind::Desktop, None);
    fixture.coordinator.set_platform(other.clone()).await;
    assert_eq!(fixture.coordinator.platform(), other);
    assert_eq!(fixture.coordinator.worker_generation().await, None);

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);

    let requests = fixture.launcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].platform, other);

    // Same platform again is a no-op.
    fixture.coordinator.set_platform(other).await;
    assert!(fixture.coordinator.worker_generation().await.is_some());
}

#[tokio::test]
async fn test_reset_starts_fresh_worker() {
    let fixture = Fixture::simple();
    let ticket = fixture.coordinator.run("print(1)").unwrap();
    ticket.outcome().await;
    let before = fixture.coordinator.worker_generation().await.unwrap();

    fixture.coordinator.reset().await.unwrap();
    let after = fixture.coordinator.worker_generation().await.unwrap();

    assert!(after > before);
    assert_eq!(fixture.launcher.launches(), 2);
}

#[tokio::test]
async fn test_reset_cancels_run_in_flight() {
    let fixture = Fixture::simple();
    let ticket = fixture.coordinator.run("sleep(30000)").unwrap();
    wait_for_state(&fixture.coordinator, RunState::Running).await;

    fixture.coordinator.reset().await.unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Canceled);
    assert!(fixture.coordinator.worker_generation().await.is_some());
}

#[tokio::test]
async fn test_shutdown_stops_worker() {
    let fixture = Fixture::simple();
    let ticket = fixture.coordinator.run("print(1)").unwrap();
    ticket.outcome().await;

    fixture.coordinator.shutdown().await;
    assert_eq!(fixture.coordinator.worker_generation().await, None);
}

#[tokio::test]
async fn test_documents_run_independently() {
    let a = Fixture::simple();
    let b = Fixture::simple();

    let slow = a.coordinator.run("sleep(300)\nprint(1)").unwrap();
    let fast = b.coordinator.run("print(2)").unwrap();

    let fast_outcome = tokio::time::timeout(Duration::from_millis(250), fast.outcome())
        .await
        .expect("second document should not wait for the first");
    assert_eq!(fast_outcome, RunOutcome::Completed);
    assert_eq!(slow.outcome().await, RunOutcome::Completed);
}

#[tokio::test]
async fn test_dropped_subscriber_does_not_stall() {
    let fixture = Fixture::simple();
    let dropped = fixture.coordinator.subscribe();
    drop(dropped);
    let mut rx = fixture.coordinator.subscribe();

    let ticket = fixture.coordinator.run("print(1)").unwrap();
    assert_eq!(ticket.outcome().await, RunOutcome::Completed);
    assert_eq!(drain(&mut rx).await.len(), 2);
}

#[tokio::test]
async fn test_compile_and_emit_writes_payload() {
    let fixture = Fixture::simple();
    let path = fixture.temp.path().join("build").join("snippet.payload.json");

    let diagnostics = fixture
        .coordinator
        .compile_and_emit("print(1)", &path)
        .await
        .unwrap();
    assert!(diagnostics.is_empty());

    let program = Program::from_payload(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(program.statements.len(), 1);
    assert_eq!(fixture.launcher.launches(), 0);

    let err = fixture
        .coordinator
        .compile_and_emit("print(", &path.with_file_name("bad.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Compile { .. }));
}
