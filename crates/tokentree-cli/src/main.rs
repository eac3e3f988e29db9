//! Tokentree CLI
//!
//! Browse the likely continuations of a prompt one page at a time, against a
//! running generation backend.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokentree_core::{ExplorationSession, ExplorerConfig, HttpBackend, HttpConfig};
use tracing_subscriber::EnvFilter;

mod repl;

#[derive(Parser)]
#[command(name = "tokentree")]
#[command(author, version, about = "Tokentree: explore the token tree of a prompt")]
struct Cli {
    /// Log filter, e.g. `tokentree_core=debug` (defaults to RUST_LOG, then `warn`)
    #[arg(long, global = true)]
    log: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive exploration of PROMPT.
    ///
    /// Commands: n/right, p/left, d/down, u/up, g <index>, s (stats), q.
    Explore {
        prompt: String,
        /// Base URL of the generation backend
        #[arg(long, env = "TOKENTREE_BACKEND_URL")]
        backend_url: String,
        /// Policy boundary: tokens per page
        #[arg(short = 'k', long)]
        page_width: Option<usize>,
        /// Layers fetched with the initial tree
        #[arg(short = 'n', long)]
        depth: Option<usize>,
        /// Per-request timeout
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| anyhow!("invalid --log filter {directives:?}: {e}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref())?;

    match cli.command {
        Commands::Explore {
            prompt,
            backend_url,
            page_width,
            depth,
            timeout_secs,
        } => {
            let mut config = ExplorerConfig::from_env()?;
            if let Some(k) = page_width {
                config = config.with_page_width(k);
            }
            if let Some(n) = depth {
                config = config.with_initial_depth(n);
            }

            let http = HttpConfig::new(&backend_url).with_timeout_secs(timeout_secs);
            http.validate()?;
            tracing::debug!(url = %http.base_url, k = config.page_width, n = config.initial_depth, "connecting");
            let backend = Arc::new(HttpBackend::new(http)?);

            let mut session = ExplorationSession::start(backend, &prompt, config)
                .await
                .with_context(|| format!("failed to start exploring {prompt:?}"))?;
            repl::run(&mut session).await?;
            session.shutdown();
        }
    }

    Ok(())
}
