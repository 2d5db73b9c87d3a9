//! Command-line driver for the precache offline agent.
//!
//! Runs the agent against an on-disk bucket store and the live network.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest into the configured version's bucket
//! precache --config precache.json install
//!
//! # Remove buckets left by earlier versions
//! precache --config precache.json activate
//!
//! # Run one request through the agent
//! precache --config precache.json fetch https://app.example/ --navigate
//!
//! # Inspect stored buckets
//! precache --config precache.json list app-cache-v1
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use precache_common::{init_logging, LogConfig, LogFormat};

mod commands;

#[derive(Parser)]
#[command(name = "precache")]
#[command(about = "Cache-first offline agent driver")]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(short, long, default_value = "precache.json")]
    config: PathBuf,

    /// Bucket store directory
    #[arg(short, long, default_value = ".precache")]
    store: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum entries per bucket
    #[arg(long)]
    max_entries: Option<usize>,

    /// Maximum stored body bytes per bucket
    #[arg(long)]
    max_bytes: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the manifest into the current bucket
    Install,

    /// Delete every bucket except the current version
    Activate,

    /// Run one request through the agent
    Fetch {
        /// Absolute URL, or a path resolved against the configured origin
        url: String,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,
    },

    /// List bucket names, or the entries of one bucket
    List {
        /// Bucket to inspect
        bucket: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    let ctx = commands::Context::open(
        &cli.config,
        &cli.store,
        commands::Limits {
            max_entries: cli.max_entries,
            max_bytes: cli.max_bytes,
        },
    )
    .await?;

    match cli.command {
        Commands::Install => commands::install(&ctx).await?,
        Commands::Activate => commands::activate(&ctx).await?,
        Commands::Fetch {
            url,
            navigate,
            method,
        } => commands::fetch(&ctx, &url, navigate, &method).await?,
        Commands::List { bucket, json } => commands::list(&ctx, bucket.as_deref(), json).await?,
    }

    Ok(())
}
