use anyhow::Result;
use chrono::{Local, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod chat;
mod config;
mod courts;
mod error;
mod identity;
mod ledger;
mod metrics;
mod protocol;
mod ratelimit;
mod sanitize;
mod server;
mod store;

use chat::ChatStore;
use courts::CourtDirectory;
use identity::IdentityClient;
use ledger::CheckInLedger;
use metrics::Metrics;
use ratelimit::ActionLimits;
use store::{Snapshot, SnapshotStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playground_jam_coordinator=info".parse()?)
        )
        .init();

    info!("Starting Playground Jam coordinator");

    let config = config::load_config()?;
    info!("Configuration loaded");
    info!("Server: {}", config.server.bind_addr);

    let courts = Arc::new(CourtDirectory::from_seed()?);
    let ledger = Arc::new(CheckInLedger::new());
    let chat = Arc::new(ChatStore::new(&config.chat));
    let limits = Arc::new(ActionLimits::new(&config.limits));
    let identity = Arc::new(IdentityClient::new(
        config.identity.base_url.clone(),
        config.identity.request_timeout_ms,
    )?);
    let metrics = Arc::new(Metrics::new());
    let snapshots = SnapshotStore::new(&config.storage);

    if let Some(snapshot) = snapshots.load() {
        snapshot.apply(&courts, &ledger, &limits);
        info!(
            "Snapshot restored: {} active check-ins across {} courts",
            ledger.total_active(),
            courts.count()
        );
    }

    // Periodic chat retention sweep
    let sweep_chat = chat.clone();
    let sweep_metrics = metrics.clone();
    let sweep_interval = config.chat.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            let removed = sweep_chat.prune_expired();
            if removed > 0 {
                sweep_metrics.add_pruned(removed as u64);
                info!("Retention sweep dropped {} chat messages", removed);
            }
        }
    });

    // Periodic state snapshot; a failed save is logged and retried next round
    let flush_courts = courts.clone();
    let flush_ledger = ledger.clone();
    let flush_limits = limits.clone();
    let flush_store = SnapshotStore::new(&config.storage);
    let flush_metrics = metrics.clone();
    let flush_interval = config.storage.flush_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(flush_interval));
        loop {
            interval.tick().await;
            let snapshot = Snapshot::capture(&flush_courts, &flush_ledger, &flush_limits);
            match flush_store.save(&snapshot) {
                Ok(()) => flush_metrics.inc_snapshots(),
                Err(e) => warn!("Snapshot save failed: {}", e),
            }
        }
    });

    // Occupancy reset at 23:59 local time
    let reset_ledger = ledger.clone();
    let reset_courts = courts.clone();
    let reset_metrics = metrics.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_daily_reset()).await;
            reset_ledger.reset_daily(&reset_courts);
            reset_metrics.inc_daily_resets();
            info!("Daily check-in reset completed");
            // step past the 23:59 minute before rescheduling
            tokio::time::sleep(Duration::from_secs(61)).await;
        }
    });

    let metrics_config = config.metrics.clone();
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        metrics::run_metrics_server(metrics_config, metrics_clone).await;
    });

    server::run(
        config,
        courts.clone(),
        ledger.clone(),
        chat.clone(),
        limits.clone(),
        identity,
        metrics.clone(),
    )
    .await?;

    info!("Saving final snapshot");
    let snapshot = Snapshot::capture(&courts, &ledger, &limits);
    if let Err(e) = snapshots.save(&snapshot) {
        warn!("Final snapshot save failed: {}", e);
    }

    Ok(())
}

/// Time until the next 23:59 local wall clock.
fn until_daily_reset() -> Duration {
    const TARGET_SECS: u32 = 23 * 3600 + 59 * 60;
    const DAY_SECS: u32 = 24 * 3600;

    let now = Local::now();
    let secs_today = now.num_seconds_from_midnight();
    let wait = if secs_today < TARGET_SECS {
        TARGET_SECS - secs_today
    } else {
        DAY_SECS - secs_today + TARGET_SECS
    };
    Duration::from_secs(u64::from(wait))
}
