//! Scratchpad CLI - run snippets in an isolated worker process.

mod colors;
mod emit;
mod output;
mod platforms;
mod restore;
mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "scratchpad")]
#[command(about = "Run scratchpad snippets in an isolated worker process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore packages, compile and run a snippet
    Run {
        /// Path to the snippet file
        snippet: String,

        /// Platform to run under (e.g. x64-core, x86-desktop)
        #[arg(long)]
        platform: Option<String>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Compile a snippet and write the payload without running it
    Emit {
        /// Path to the snippet file
        snippet: String,

        /// Output path for the payload
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Restore the packages a snippet references
    Restore {
        /// Path to the snippet file
        snippet: String,
    },

    /// List the platforms a worker can be launched for
    Platforms,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format scratchpad-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<scratchpad_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            snippet,
            platform,
            timeout,
        } => {
            run::execute(&snippet, platform.as_deref(), timeout)
                .await
                .map_err(format_error)?;
        }

        Commands::Emit { snippet, output } => {
            emit::execute(&snippet, output.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Restore { snippet } => {
            restore::execute(&snippet).await.map_err(format_error)?;
        }

        Commands::Platforms => platforms::execute(),
    }

    Ok(())
}

/// Read a snippet file, failing with a readable message when it is missing.
pub(crate) fn read_snippet(path: &str) -> anyhow::Result<(std::path::PathBuf, String)> {
    let path = std::path::PathBuf::from(path);
    if !path.exists() {
        anyhow::bail!("Snippet not found: {}", path.display());
    }
    let source = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok((path, source))
}
