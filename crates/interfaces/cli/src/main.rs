mod recovery_cmds;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use salvage_config::AppConfig;
use salvage_recovery::DocumentId;

#[derive(Debug, Parser)]
#[command(
    name = "salvage",
    version,
    about = "Inspect and recover unsaved documents left behind by a crash"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, value_name = "PATH", default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the recovery directory and autosave settings.
    Status,
    /// List recoverable documents, newest first.
    List {
        /// Read and checksum every record, marking corrupted ones.
        #[arg(long)]
        verify: bool,
    },
    /// Print the recovered content of one document.
    Preview {
        id: DocumentId,
        /// Only show the first N lines.
        #[arg(long, value_name = "N")]
        lines: Option<usize>,
    },
    /// Write recovered documents to a directory and clear their records.
    Restore {
        ids: Vec<DocumentId>,
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        #[arg(long, value_name = "DIR", default_value = ".salvage/restored")]
        output: PathBuf,
    },
    /// Delete recovery data without restoring it.
    Discard {
        ids: Vec<DocumentId>,
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Apply the retention limits from the config now.
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let manager = recovery_cmds::open_manager(&config).await?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => recovery_cmds::run_status(&manager, &config).await,
        Commands::List { verify } => recovery_cmds::run_list(&manager, verify).await,
        Commands::Preview { id, lines } => {
            recovery_cmds::run_preview(&manager, id, lines.map(|n| n.max(1))).await?;
        }
        Commands::Restore { ids, all, output } => {
            recovery_cmds::run_restore(&manager, ids, all, &output).await?;
        }
        Commands::Discard { ids, all, yes } => {
            recovery_cmds::run_discard(&manager, ids, all, yes).await?;
        }
        Commands::Prune => recovery_cmds::run_prune(&manager, &config).await?,
    }

    Ok(())
}
