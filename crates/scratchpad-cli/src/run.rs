//! Run command implementation for the scratchpad CLI.
//!
//! Restores packages, compiles and executes a snippet in a worker process,
//! printing records as they arrive.

use std::time::{Duration, Instant};

use scratchpad_core::{
    DocumentDirs, ExecutionCoordinator, Platform, RunEvent, RunOutcome, ScratchpadConfig,
};

use crate::colors;
use crate::output::{outcome_line, print_record};

/// Run a snippet file.
pub async fn execute(
    snippet_path: &str,
    platform: Option<&str>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let (path, source) = crate::read_snippet(snippet_path)?;

    let mut config = ScratchpadConfig::from_env();
    if let Some(platform) = platform {
        config.coordinator.platform = platform.parse::<Platform>()?;
    }
    let dirs = DocumentDirs::from_document_path(&path)?;

    println!(
        "{}Running{} {} {}({}){}",
        colors::BOLD,
        colors::RESET,
        path.display(),
        colors::DIM,
        config.coordinator.platform,
        colors::RESET
    );

    let coordinator = ExecutionCoordinator::from_config(&config, &dirs.work_dir);
    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunEvent::Record(record) => print_record(&record),
                RunEvent::Finished(_) => break,
            }
        }
    });

    let ticket = coordinator.run(source)?;
    let outcome = ticket.outcome();
    tokio::pin!(outcome);

    let deadline = async {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        outcome = &mut outcome => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}Canceling...{}", colors::YELLOW, colors::RESET);
            coordinator.cancel().await;
            outcome.await
        }
        _ = deadline => {
            eprintln!(
                "{}Timed out after {}s, canceling...{}",
                colors::YELLOW,
                timeout.unwrap_or_default(),
                colors::RESET
            );
            coordinator.cancel().await;
            outcome.await
        }
    };

    let _ = printer.await;
    coordinator.shutdown().await;

    println!(
        "\n{} in {:.2}s",
        outcome_line(&outcome),
        start.elapsed().as_secs_f64()
    );

    match outcome {
        RunOutcome::Completed => Ok(()),
        other => anyhow::bail!("Run {}", other),
    }
}
