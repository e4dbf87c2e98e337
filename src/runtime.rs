use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Config;
use crate::service::Service;

/// Upper bound for a single discovery or interaction cycle.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Drives the two periodic cycles. Each enabled cycle runs once immediately,
/// then on its ticker; in `--once` mode each enabled cycle runs exactly once
/// and the function returns. Cycle failures in daemon mode are logged and the
/// loop continues on the next tick.
pub async fn run(cfg: &Config, service: &Service) -> Result<()> {
    if cfg.run_once {
        if cfg.discovery_interval().is_some() {
            run_discovery(service).await?;
        }
        if cfg.interaction_interval().is_some() {
            run_interaction(service).await?;
        }
        return Ok(());
    }

    let mut discovery_ticker = cfg.discovery_interval().map(new_ticker);
    let mut interaction_ticker = cfg.interaction_interval().map(new_ticker);

    loop {
        // A disabled ticker never fires; its branch stays pending forever.
        tokio::select! {
            _ = tick(&mut discovery_ticker) => {
                if let Err(err) = run_discovery(service).await {
                    error!("discovery cycle failed: {err:#}");
                }
            }
            _ = tick(&mut interaction_ticker) => {
                if let Err(err) = run_interaction(service).await {
                    error!("interaction cycle failed: {err:#}");
                }
            }
        }
    }
}

fn new_ticker(period: Duration) -> Interval {
    // The first tick fires immediately, giving the run-on-startup behavior.
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_discovery(service: &Service) -> Result<()> {
    info!("discovery cycle starting");
    tokio::time::timeout(CYCLE_TIMEOUT, service.discovery_once())
        .await
        .context("discovery cycle timed out")??;
    info!("discovery cycle finished");
    Ok(())
}

async fn run_interaction(service: &Service) -> Result<()> {
    info!("interaction cycle starting");
    tokio::time::timeout(CYCLE_TIMEOUT, service.interaction_once())
        .await
        .context("interaction cycle timed out")??;
    info!("interaction cycle finished");
    Ok(())
}
