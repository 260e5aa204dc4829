pub mod daemon;
pub mod resources;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// pocketd - job orchestration daemon for the pocket analysis pipeline
#[derive(Parser, Debug)]
#[command(
    name = "pocketd",
    version,
    about = "Job orchestration daemon for the pocket analysis pipeline"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory path
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,
    },

    /// Show disk usage of the job storage root
    Usage {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the oldest jobs
    Oldest {
        /// Number of jobs to show
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete jobs past the retention period
    Cleanup {
        /// Only list what would be deleted
        #[arg(long)]
        dry_run: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the resolved configuration and print it
    CheckConfig,
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    let data_dir = cli.data_dir.as_deref();
    match &cli.command {
        Commands::Serve { host, port } => {
            daemon::cmd_serve(config, data_dir, host.as_deref(), *port).await
        }
        Commands::CheckConfig => daemon::cmd_check_config(config, data_dir),
        Commands::Usage { json } => resources::cmd_usage(config, data_dir, *json).await,
        Commands::Oldest { count, json } => {
            resources::cmd_oldest(config, data_dir, *count, *json).await
        }
        Commands::Cleanup { dry_run, json } => {
            resources::cmd_cleanup(config, data_dir, *dry_run, *json).await
        }
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
