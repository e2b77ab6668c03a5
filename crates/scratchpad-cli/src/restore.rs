//! Restore command: install the packages a snippet references.

use scratchpad_core::execute::CancelToken;
use scratchpad_core::{Compiler, PackageResolver, ScratchpadConfig, SnippetCompiler};
use tokio::sync::mpsc;

use crate::colors;
use crate::output::print_record;

pub async fn execute(snippet_path: &str) -> anyhow::Result<()> {
    let (_, source) = crate::read_snippet(snippet_path)?;
    let config = ScratchpadConfig::from_env();

    let directives = SnippetCompiler::new().reference_directives(&source);
    let references = PackageResolver::extract_references(&directives);
    if references.is_empty() {
        println!("No package references found.");
        return Ok(());
    }

    let resolver = PackageResolver::from_config(&config.resolver);
    let cancel = CancelToken::new();
    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let printer = tokio::spawn(async move {
        while let Some(record) = progress_rx.recv().await {
            print_record(&record);
        }
    });

    let result = tokio::select! {
        result = resolver.ensure_available(&references, &cancel, Some(&progress_tx)) => result,
        _ = tokio::signal::ctrl_c() => Err(scratchpad_core::Error::Canceled),
    };
    drop(progress_tx);
    let _ = printer.await;

    let paths = result?;
    for (reference, path) in references.iter().zip(&paths) {
        println!(
            "{}{}{} {}",
            colors::GREEN,
            reference,
            colors::RESET,
            path.display()
        );
    }
    Ok(())
}
