#![warn(missing_docs)]

//! msync: operator CLI for metasync catalog replication.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metasync_repl::config::TierThresholds;
use metasync_repl::dry_run::DryRun;
use metasync_repl::memory::CatalogSnapshot;
use metasync_repl::{ReplConfig, TierRouter};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "msync")]
#[command(about = "metasync catalog replication CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a config file and print the effective configuration.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
        /// Overlay the deployment environment variables.
        #[arg(long)]
        env: bool,
    },
    /// Print the tier a unit with these metrics would take.
    Route {
        #[arg(short, long)]
        partitions: usize,
        #[arg(short, long)]
        bytes: usize,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Replicate a catalog snapshot end to end through in-memory services.
    DryRun {
        #[arg(short, long, default_value = "/etc/metasync/msync.toml")]
        config: PathBuf,
        #[arg(short, long)]
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config, env } => check_config(&config, env),
        Command::Route {
            partitions,
            bytes,
            config,
        } => route(partitions, bytes, config.as_deref()),
        Command::DryRun { config, snapshot } => dry_run(&config, &snapshot).await,
    }
}

fn load_or_default(path: &Path) -> Result<ReplConfig> {
    if path.exists() {
        ReplConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        Ok(ReplConfig::default())
    }
}

fn check_config(path: &Path, env: bool) -> Result<()> {
    let mut config = ReplConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    if env {
        config.apply_env(|name| std::env::var(name).ok());
    }
    config.validate()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn route_thresholds(config: Option<&Path>) -> Result<TierThresholds> {
    match config {
        Some(path) => {
            let config = load_or_default(path)?;
            config.validate()?;
            Ok(config.tiering)
        }
        None => Ok(ReplConfig::default().tiering),
    }
}

fn route(partitions: usize, bytes: usize, config: Option<&Path>) -> Result<()> {
    let thresholds = route_thresholds(config)?;
    let tier = TierRouter::new(thresholds).decide(partitions, bytes);
    println!(
        "{} (partitions={}, bytes={}, max_inline_partitions={}, max_message_bytes={})",
        tier, partitions, bytes, thresholds.max_inline_partitions, thresholds.max_message_bytes
    );
    Ok(())
}

async fn dry_run(config_path: &Path, snapshot_path: &Path) -> Result<()> {
    let config = load_or_default(config_path)?;
    let snapshot: CatalogSnapshot = serde_json::from_str(
        &std::fs::read_to_string(snapshot_path).with_context(|| format!("reading {}", snapshot_path.display()))?,
    )
    .with_context(|| format!("parsing {}", snapshot_path.display()))?;

    tracing::info!(
        databases = snapshot.databases.len(),
        tables = snapshot.tables.len(),
        "starting dry run"
    );
    let run = DryRun::new(config)?;
    run.load(snapshot).await;
    let report = run.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
