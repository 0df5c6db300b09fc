//! # Endpoint Workbench CLI (`epw`)
//!
//! Runs the workbench engine as a sidecar process for a UI host, plus a
//! few utilities for inspecting identities and persisted test state.
//!
//! ## Usage
//!
//! ```bash
//! epw --config ./epw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `epw serve` | Serve NDJSON envelopes on stdin/stdout |
//! | `epw slug <path>` | Print the slug of a resource path |
//! | `epw path <slug>` | Print the resource path of a slug |
//! | `epw history` | List every persisted test state |
//! | `epw history <id>` | Print the test state and history of an identifier |
//! | `epw history <id> --clear` | Drop the history of an identifier |
//! | `epw history <id> --delete` | Delete the test state of an identifier |
//! | `epw reset` | Delete every persisted test state |
//!
//! Logs go to stderr and are filtered with `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use endpoint_workbench::config;
use endpoint_workbench::history::TestStateStore;
use endpoint_workbench::identity;
use endpoint_workbench::stdio;
use endpoint_workbench::store::SqliteKvStore;

/// Endpoint Workbench: edit remote API endpoint definitions as facets.
#[derive(Parser)]
#[command(name = "epw", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./epw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the engine over stdin/stdout.
    ///
    /// Every line is one JSON envelope `{type, requestId?, payload?}`.
    /// Replies and host notifications are written to stdout.
    Serve,

    /// Print the slug for a resource path.
    Slug { path: String },

    /// Print the resource path for a slug.
    Path { slug: String },

    /// Show the persisted test state of a slug or template path, or list
    /// every state when no identifier is given.
    History {
        id: Option<String>,

        /// Clear the execution history instead of printing it.
        #[arg(long, requires = "id")]
        clear: bool,

        /// Delete the whole test state.
        #[arg(long, requires = "id", conflicts_with = "clear")]
        delete: bool,
    },

    /// Delete all persisted test states.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let load = || config::load_config(&cli.config);

    match &cli.command {
        Commands::Serve => {
            stdio::serve(&load()?).await?;
        }
        Commands::Slug { path } => {
            println!("{}", identity::to_slug(path)?);
        }
        Commands::Path { slug } => {
            println!("{}", identity::to_path(slug)?);
        }
        Commands::History { id, clear, delete } => {
            let store = open_state(&load()?).await?;
            match id {
                None => {
                    let states = store.list_states().await?;
                    if states.is_empty() {
                        println!("No test states.");
                    }
                    for state in states {
                        println!(
                            "{}  {:?}  {} run(s)  last used {}",
                            state.id,
                            state.kind,
                            state.history.len(),
                            state.last_used.to_rfc3339()
                        );
                    }
                }
                Some(id) if *delete => {
                    if store.delete_state(id).await? {
                        println!("Deleted test state for {}.", id);
                    } else {
                        println!("No test state for {}.", id);
                    }
                }
                Some(id) if *clear => {
                    store.clear_history(id).await?;
                    println!("History cleared for {}.", id);
                }
                Some(id) => match store.get_state(id).await? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => println!("No test state for {}.", id),
                },
            }
        }
        Commands::Reset => {
            let removed = open_state(&load()?).await?.reset_all().await?;
            println!("Removed {} test state(s).", removed);
        }
    }

    Ok(())
}

async fn open_state(cfg: &config::Config) -> anyhow::Result<TestStateStore> {
    let kv = SqliteKvStore::connect(&cfg.state.path).await?;
    Ok(TestStateStore::new(Arc::new(kv)))
}
