//! Emit command: compile a snippet and write its payload.

use std::path::PathBuf;

use scratchpad_core::{DocumentDirs, ExecutionCoordinator, ScratchpadConfig};

use crate::colors;
use crate::output::print_record;

/// Compile a snippet file without running it.
pub async fn execute(snippet_path: &str, output: Option<&str>) -> anyhow::Result<()> {
    let (path, source) = crate::read_snippet(snippet_path)?;
    let dirs = DocumentDirs::from_document_path(&path)?;
    let output_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs.artifact_path(&path));

    let coordinator = ExecutionCoordinator::from_config(&ScratchpadConfig::from_env(), &dirs.work_dir);
    let diagnostics = match coordinator.compile_and_emit(&source, &output_path).await {
        Ok(diagnostics) => diagnostics,
        Err(scratchpad_core::Error::Compile { diagnostics }) => {
            for diagnostic in &diagnostics {
                print_record(&diagnostic.clone().into());
            }
            anyhow::bail!(
                "Compilation failed with {} error(s)",
                diagnostics.iter().filter(|d| d.is_error()).count()
            );
        }
        Err(e) => return Err(e.into()),
    };

    for diagnostic in &diagnostics {
        print_record(&diagnostic.clone().into());
    }
    println!(
        "{}Wrote{} {}",
        colors::GREEN,
        colors::RESET,
        output_path.display()
    );
    Ok(())
}
