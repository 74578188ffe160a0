//! meridiand — the Meridian placement daemon.
//!
//! Runs the placement controllers for every cluster named in the config:
//! - Schedule Reconciler (picks a target cluster per proxy pod)
//! - proxy scheduler (candidate reservation protocol, source side)
//! - candidate scheduler (reservations and binding, target side)
//! - Chaperon, Feedback and NodePool reconcilers
//!
//! # Usage
//!
//! ```text
//! meridiand standalone --config meridian.toml --submit pod.json
//! meridiand check-config --config meridian.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meridian_core::MeridianConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,meridiand=debug,meridian=debug";

#[derive(Parser)]
#[command(name = "meridiand", about = "Meridian multi-cluster placement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every cluster and controller in one process until Ctrl-C.
    Standalone {
        /// Path to meridian.toml.
        #[arg(long, default_value = "meridian.toml")]
        config: PathBuf,

        /// Pod manifests (JSON) to submit once the controllers are up.
        #[arg(long)]
        submit: Vec<PathBuf>,

        /// Cluster receiving submitted pods; defaults to the first configured.
        #[arg(long)]
        cluster: Option<String>,

        /// Emit logs as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Validate a config file and print the resolved topology.
    CheckConfig {
        #[arg(long, default_value = "meridian.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            submit,
            cluster,
            json,
        } => {
            init_tracing(json);
            run_standalone(config, submit, cluster).await
        }
        Command::CheckConfig { config } => check_config(config),
    }
}

async fn run_standalone(
    config_path: PathBuf,
    submissions: Vec<PathBuf>,
    cluster: Option<String>,
) -> anyhow::Result<()> {
    let config = MeridianConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(config = %config_path.display(), clusters = config.clusters.len(), "meridiand starting");

    // ── Stores ─────────────────────────────────────────────────

    let clusters = meridiand::open_clusters(&config)?;
    meridiand::seed(&config, &clusters)?;

    // ── Controllers ────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let settings = meridiand::Settings::from_config(&config);
    let handles = meridiand::start(&clusters, &config.topology(), &settings, &shutdown_rx);
    clusters.mark_synced();

    // ── Submissions ────────────────────────────────────────────

    if !submissions.is_empty() {
        let name = cluster
            .or_else(|| config.clusters.first().map(|c| c.name.clone()))
            .context("no cluster to submit to")?;
        let store = clusters.get(&name)?;
        for path in &submissions {
            let pod = meridiand::load_pod(path)?;
            meridiand::submit(store, &pod)?;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("meridiand stopped");
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config =
        MeridianConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    let topology = config.topology();
    println!("{}: ok", path.display());
    for cluster in &config.clusters {
        println!(
            "  {} -> [{}]",
            cluster.name,
            topology.targets_of(&cluster.name).join(", ")
        );
    }
    for federation in &config.federations {
        println!("  federation {}: [{}]", federation.name, federation.clusters.join(", "));
    }
    Ok(())
}
