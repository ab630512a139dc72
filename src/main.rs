//! # Vault Context CLI (`vctx`)
//!
//! Scan a markdown vault, rank its documents, ask questions about it, or
//! serve the same pipeline over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! vctx --config ./config/vctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vctx scan` | List every markdown document with a summary |
//! | `vctx read <id>` | Print one document without its front-matter |
//! | `vctx select "<query>"` | Rank documents against a query |
//! | `vctx ask "<query>"` | Retrieve context and stream a model answer |
//! | `vctx serve` | Start the HTTP server |
//!
//! Log verbosity follows `RUST_LOG` (default `warn`). Logs go to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vault_context::cli::{self, SelectOptions};
use vault_context::config::{self, Config};
use vault_context::server;

/// Vault Context CLI: bounded context assembly over a markdown vault.
#[derive(Parser)]
#[command(
    name = "vctx",
    about = "Vault Context: ask questions about a folder of markdown notes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When omitted, built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the vault and list its markdown documents, newest first.
    Scan {
        /// Absolute vault root. Defaults to `[vault].default_root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Print a document by id.
    Read {
        /// Document id as printed by `scan` or `select`.
        id: String,

        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Rank documents against a query with keyword scoring.
    Select {
        query: String,

        #[arg(long)]
        root: Option<PathBuf>,

        /// Maximum number of documents. Defaults to `[retrieval].max_files`.
        #[arg(long)]
        limit: Option<usize>,

        /// Only consider documents carrying this tag. Repeatable.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only consider documents under this relative folder.
        #[arg(long)]
        folder: Option<String>,
    },

    /// Answer a question from vault context, streaming the reply.
    Ask {
        query: String,

        #[arg(long)]
        root: Option<PathBuf>,

        /// Use these documents as context instead of automatic selection.
        /// Repeatable.
        #[arg(long = "file-id")]
        file_ids: Vec<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    match args.command {
        Commands::Scan { root } => {
            cli::run_scan(&cfg, root).await?;
        }
        Commands::Read { id, root } => {
            cli::run_read(&cfg, root, &id).await?;
        }
        Commands::Select {
            query,
            root,
            limit,
            tags,
            folder,
        } => {
            let options = SelectOptions {
                limit,
                tags,
                folder,
            };
            cli::run_select(&cfg, root, &query, options).await?;
        }
        Commands::Ask {
            query,
            root,
            file_ids,
        } => {
            cli::run_ask(&cfg, root, &query, file_ids).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
