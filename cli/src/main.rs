//! `lsp-probe`: run one LSP tool query from the command line.
//!
//! ```text
//! lsp-probe --config lsp.toml --root . hover src/main.py 12 4
//! ```
//!
//! Logs go to stderr (filter with `RUST_LOG`); the tool output goes to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use nanobot_lsp::{LspConfig, LspManager};
use nanobot_tools::{ToolRegistry, register_lsp_tools};

#[derive(Parser, Debug)]
#[command(name = "lsp-probe", about = "Query a language server the way the agent's LSP tools do")]
struct Args {
    /// TOML file with `[servers.<language>]` entries.
    #[arg(long)]
    config: PathBuf,

    /// Workspace root; defaults to the current directory.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    query: Query,

    file: String,

    /// 1-based line.
    line: u32,

    /// 0-based character offset.
    character: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Query {
    Definition,
    References,
    Hover,
}

impl Query {
    fn tool_name(self) -> &'static str {
        match self {
            Self::Definition => "lsp_definition",
            Self::References => "lsp_references",
            Self::Hover => "lsp_hover",
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = LspConfig::load(&args.config)?;
    let root = std::path::absolute(&args.root)
        .with_context(|| format!("resolving workspace root {}", args.root.display()))?;
    let manager = Arc::new(LspManager::new(config, root));

    let mut registry = ToolRegistry::default();
    register_lsp_tools(&mut registry, &manager)?;

    let tool_args = serde_json::json!({
        "file_path": args.file,
        "line": args.line,
        "character": args.character,
    });
    tracing::info!(
        tool = args.query.tool_name(),
        file = %args.file,
        line = args.line,
        character = args.character,
        "Running LSP query"
    );
    let outcome = registry.execute(args.query.tool_name(), tool_args).await;
    if let Err(e) = &outcome {
        tracing::warn!("LSP query failed: {e}");
    }

    // Shut down before propagating the query outcome.
    manager.shutdown_all().await;

    let output = outcome.context("LSP query failed")?;
    println!("{output}");
    Ok(())
}
