//! # Hazard Ingest CLI (`hazard-ingest`)
//!
//! ## Usage
//!
//! ```bash
//! hazard-ingest --config ./config/hazards.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hazard-ingest init` | Create the SQLite database and run schema migrations |
//! | `hazard-ingest run` | Run one ingestion pass |
//! | `hazard-ingest stats` | Print database statistics |
//!
//! `run` exits with status 0 when the road stage or the imagery stage
//! succeeded, 1 otherwise. It is meant to be invoked by an external
//! scheduler.

use clap::{Parser, Subcommand};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use hazard_ingest::config::{self, Config};
use hazard_ingest::pipeline::{self, RunOptions};
use hazard_ingest::store::sqlite::SqliteStore;
use hazard_ingest::{db, migrate, stats};

/// Road-hazard ingestion from OpenStreetMap and Mapillary.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hazards.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "hazard-ingest",
    about = "Ingest road networks and street-level hazard detections into SQLite",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hazards.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Run one ingestion pass.
    ///
    /// Fetches roads and new imagery, stores hazard points, triggers
    /// clustering and advances the checkpoint.
    Run {
        /// Backfill from this instant (RFC 3339). Ignores the stored
        /// checkpoint and leaves it untouched.
        #[arg(long)]
        force_start_date: Option<DateTime<Utc>>,
    },

    /// Show database statistics.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { force_start_date } => run_ingest(&cfg, force_start_date).await,
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_ingest(
    cfg: &Config,
    force_start_date: Option<DateTime<Utc>>,
) -> anyhow::Result<ExitCode> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    let options = RunOptions { force_start_date };
    let report = pipeline::run(cfg, &store, &options).await;
    pool.close().await;

    println!("{}", report);
    Ok(ExitCode::from(report.exit_code()))
}
