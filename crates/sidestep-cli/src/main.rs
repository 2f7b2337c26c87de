//! sidestep command-line frontend
//!
//! Loads and migrates the configuration, binds the worker pool, and
//! either mangles traffic until interrupted or runs a discovery suite
//! against a target domain.

mod args;
mod logging;

use anyhow::{Context, Result};
use args::{Args, Command};
use clap::Parser;
use colored::Colorize;
use sidestep_core::discovery::Discovery;
use sidestep_core::hub::DiscoveryHub;
use sidestep_core::{Config, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args)?;

    let config = load_config(&args.config)?;

    match args.command {
        Command::Run => run(config).await,
        Command::Discover { ref target, save } => {
            discover(config, target, save.then(|| args.config.clone())).await
        }
        Command::ShowConfig => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

/// Load the configuration, falling back to defaults when the file does
/// not exist yet; migrated documents are written back.
fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        warn!(path, "configuration file not found, using defaults");
        return Ok(Config::default());
    }

    let (config, migrated) = Config::load(path).with_context(|| format!("loading {path}"))?;
    if migrated {
        config
            .save(path)
            .with_context(|| format!("writing migrated config to {path}"))?;
        info!(path, "configuration migrated and saved");
    }
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let pool = Arc::new(Pool::new(config, HashMap::new()));
    let workers = pool
        .start(tokio::runtime::Handle::current())
        .context("binding kernel queues (root or CAP_NET_ADMIN required)")?;

    info!("sidestep running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    pool.stop();
    drop(workers);
    Ok(())
}

async fn discover(config: Config, target: &str, save_to: Option<String>) -> Result<()> {
    let pool = Arc::new(Pool::new(config, HashMap::new()));
    let _workers = pool
        .start(tokio::runtime::Handle::current())
        .context("binding kernel queues (root or CAP_NET_ADMIN required)")?;

    let hub = Arc::new(DiscoveryHub::new());
    let mut progress = hub.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(line) = progress.recv().await {
            eprintln!("{} {}", "discovery".cyan().bold(), line);
        }
    });

    let discovery = Discovery::new(pool.clone(), hub.clone());
    let suite = discovery.run(target).await?;
    printer.abort();

    println!();
    println!("{} {:?}", "status:".bold(), suite.status());
    if let Some((preset, speed)) = suite.best() {
        println!(
            "{} {} ({:.1} KB/s)",
            "winner:".bold(),
            preset.green(),
            speed / 1024.0
        );
    } else {
        println!("{}", "no preset restored reachability".red());
    }
    if let Some(fp) = suite.fingerprint() {
        println!(
            "{} type={:?} blocking={:?} hops={} confidence={}%",
            "fingerprint:".bold(),
            fp.dpi_type,
            fp.blocking,
            fp.dpi_hop_count,
            fp.confidence
        );
    }
    if let Some(dns) = suite.dns_result() {
        if dns.is_poisoned {
            println!(
                "{} poisoned; server='{}' fragment={}",
                "dns:".bold(),
                dns.best_server,
                dns.needs_fragment
            );
        }
    }

    if let Some(path) = save_to {
        let installed = pool.snapshot();
        installed
            .save(&path)
            .with_context(|| format!("saving winning configuration to {path}"))?;
        println!("{} {}", "saved:".bold(), path);
    }

    pool.stop();
    Ok(())
}
