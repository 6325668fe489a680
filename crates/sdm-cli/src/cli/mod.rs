//! CLI for the SDM download manager.

mod commands;
mod view;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sdm_core::config;
use sdm_core::controller::Controller;
use sdm_core::item::NoRefresh;
use sdm_core::registry::Registry;
use std::sync::Arc;

use commands::{run_add, run_pause, run_remove, run_resume, run_scheduler, run_status};

/// Top-level CLI for the SDM download manager.
#[derive(Debug, Parser)]
#[command(name = "sdm")]
#[command(about = "SDM: multi-connection segmented download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download item.
    Add {
        /// Direct HTTP/HTTPS URL (or media page URL already resolved to one).
        url: String,
        /// Directory where the file will be saved (default: current directory).
        #[arg(long, value_name = "DIR")]
        folder: Option<std::path::PathBuf>,
        /// Explicit output file name; derived from the URL when omitted.
        #[arg(long)]
        name: Option<String>,
        /// Separate audio stream URL (DASH video+audio).
        #[arg(long, value_name = "URL")]
        audio_url: Option<String>,
        /// HLS master manifest URL.
        #[arg(long, value_name = "URL")]
        manifest_url: Option<String>,
        /// Treat the URL as an HLS media playlist.
        #[arg(long)]
        hls: bool,
        /// Hold the item until this unix time instead of downloading now.
        #[arg(long, value_name = "UNIX_SECS")]
        at: Option<u64>,
    },

    /// Run the scheduler until every queued item reaches a terminal state.
    Run {
        /// Shell command to run once after the queue drains.
        #[arg(long, value_name = "CMD")]
        on_complete: Option<String>,
        /// Power off the machine after the queue drains.
        #[arg(long)]
        shutdown: bool,
    },

    /// Show status of all items.
    Status,

    /// Pause an item by uid. Progress is kept; resume continues it.
    Pause {
        /// Item identifier (prefix accepted).
        uid: String,
    },

    /// Re-queue a paused or failed item by uid.
    Resume {
        /// Item identifier (prefix accepted).
        uid: String,
    },

    /// Remove an item by uid. With --delete-files, also deletes the final file.
    Remove {
        /// Item identifier (prefix accepted).
        uid: String,
        #[arg(long)]
        delete_files: bool,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        let controller = Controller::new(cfg, Registry::open_default()?, Arc::new(NoRefresh));
        controller.restore().await?;

        match cli.command {
            CliCommand::Add {
                url,
                folder,
                name,
                audio_url,
                manifest_url,
                hls,
                at,
            } => {
                let folder = folder
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_default();
                run_add(
                    &controller,
                    &url,
                    &folder,
                    name,
                    audio_url,
                    manifest_url,
                    hls,
                    at,
                )
                .await?
            }
            CliCommand::Run {
                on_complete,
                shutdown,
            } => run_scheduler(&controller, on_complete, shutdown).await?,
            CliCommand::Status => run_status(&controller),
            CliCommand::Pause { uid } => run_pause(&controller, &uid).await?,
            CliCommand::Resume { uid } => run_resume(&controller, &uid).await?,
            CliCommand::Remove { uid, delete_files } => {
                run_remove(&controller, &uid, delete_files).await?
            }
        }

        Ok(())
    }
}

/// Resolve a (possibly abbreviated) uid against the registry.
pub(crate) fn resolve_uid(controller: &Controller, prefix: &str) -> Result<String> {
    let matches: Vec<String> = controller
        .list()
        .iter()
        .filter(|i| i.uid.starts_with(prefix))
        .map(|i| i.uid.clone())
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no item matches uid {prefix}"),
        1 => Ok(matches.into_iter().next().unwrap()),
        n => anyhow::bail!("uid {prefix} is ambiguous ({n} matches)"),
    }
}
