use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use samsync_core::{SyncMode, SyncScope};
use tracing_subscriber::EnvFilter;

mod commands;
mod paths;
mod ui;

#[derive(Parser)]
#[command(name = "samsync")]
#[command(about = "Sync LinkedIn conversations, messages and contacts into a workspace store.")]
#[command(version)]
struct Cli {
    /// Config file (default: $SAMSYNC_DATA_DIR/samsync.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass for an account
    Sync {
        /// Workspace the synced rows belong to
        #[arg(long)]
        workspace: String,

        /// Provider account id
        #[arg(long)]
        account: String,

        /// full or incremental
        #[arg(long, default_value = "incremental")]
        mode: SyncMode,

        /// messages, contacts or both
        #[arg(long, default_value = "both")]
        scope: SyncScope,

        /// Fetch and map only, write nothing
        #[arg(long)]
        preview: bool,

        /// Emit SAMSYNC_PROGRESS / SAMSYNC_RESULT lines on stdout
        #[arg(long)]
        progress: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List accounts connected at the provider
    Accounts {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show watermarks and row counts for a workspace
    Status {
        #[arg(long)]
        workspace: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the configured scheduler until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config, paths) = paths::load(cli.config)?;

    match cli.command {
        Commands::Sync {
            workspace,
            account,
            mode,
            scope,
            preview,
            progress,
            json,
        } => {
            let args = commands::sync::SyncArgs {
                workspace,
                account,
                mode,
                scope,
                preview,
                progress,
                json,
            };
            commands::sync::run(config, &paths, args).await
        }
        Commands::Accounts { json } => commands::accounts::run(config, json).await,
        Commands::Status { workspace, json } => {
            commands::status::run(config, &paths, &workspace, json).await
        }
        Commands::Schedule => commands::schedule::run(config, &paths).await,
    }
}
