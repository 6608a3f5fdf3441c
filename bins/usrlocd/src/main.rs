// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ims_usrloc::{DbMode, MatchingMode, MemoryUsrlocDb, Sweeper, Usrloc, UsrlocConfig};
use tokio::fs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// S-CSCF user location daemon
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON file mapped onto the usrloc configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Domain to register at startup (repeatable)
    #[arg(long = "domain", default_value = "location")]
    domains: Vec<String>,
    /// Overrides the sweep period in seconds
    #[arg(long)]
    timer_interval: Option<u64>,
    /// Overrides log2 of the IMPU table size
    #[arg(long)]
    hash_size: Option<u32>,
    /// Overrides the legacy contact matching mode (0-3)
    #[arg(long)]
    matching_mode: Option<i64>,
    /// Preload registered domains from the database before sweeping
    #[arg(long)]
    preload: bool,
    /// Seconds between statistics log lines; 0 disables them
    #[arg(long, default_value_t = 300)]
    stats_interval: u64,
}

async fn load_config(args: &Args) -> Result<UsrlocConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<UsrlocConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => UsrlocConfig::default(),
    };
    if let Some(secs) = args.timer_interval {
        config = config.with_timer_interval(secs);
    }
    if let Some(bits) = args.hash_size {
        config = config.with_hash_size(bits);
    }
    if let Some(mode) = args.matching_mode {
        config = config.with_matching_mode(MatchingMode::from_legacy(mode)?);
    }
    Ok(config)
}

// Logs statistics every `every` until `stop` flips.
fn spawn_stats(usrloc: Arc<Usrloc>, every: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = ticker.tick() => log_stats(&usrloc),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn log_stats(usrloc: &Usrloc) {
    for stats in usrloc.domain_stats() {
        info!("{}", stats);
    }
    match serde_json::to_string(&usrloc.domain_stats()) {
        Ok(json) => info!(stats = %json, total_users = usrloc.total_users(), "usrloc statistics"),
        Err(err) => warn!(error = %err, "failed to serialise statistics"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;
    let period = Duration::from_secs(config.timer_interval);

    let mut builder = Usrloc::builder(config.clone());
    if config.db_mode == DbMode::WriteThrough {
        // No SQL backend is linked in; mirror into process memory.
        warn!("write-through enabled without an external database, using in-process tables");
        builder = builder.with_db(Arc::new(MemoryUsrlocDb::new()));
    }
    let usrloc = Arc::new(builder.build().context("initialising usrloc")?);

    for name in &args.domains {
        usrloc
            .register_udomain(name)
            .with_context(|| format!("registering domain {}", name))?;
        if args.preload {
            let report = usrloc
                .preload(name)
                .with_context(|| format!("preloading domain {}", name))?;
            info!(domain = %name, impus = report.impus, contacts = report.contacts, "domain preloaded");
        }
    }

    let sweeper = Sweeper::spawn(Arc::clone(&usrloc), period);
    info!(domains = ?args.domains, period_secs = period.as_secs(), "usrlocd running");

    let (stop_stats, stats_stopped) = watch::channel(false);
    let stats = (args.stats_interval > 0).then(|| {
        spawn_stats(
            Arc::clone(&usrloc),
            Duration::from_secs(args.stats_interval),
            stats_stopped,
        )
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    stop_stats.send_replace(true);
    if let Some(stats) = stats {
        if let Err(err) = stats.await {
            warn!(error = %err, "stats task ended abnormally");
        }
    }
    sweeper.shutdown().await;
    log_stats(&usrloc);

    let snapshot = usrloc.metrics().snapshot();
    info!(
        sweeps = snapshot.sweeps,
        impus_inserted = snapshot.impus_inserted,
        contacts_reclaimed = snapshot.contacts_reclaimed,
        db_errors = snapshot.db_errors,
        "final counters"
    );
    Ok(())
}
