//! camsd - occupancy status daemon
//!
//! This daemon:
//! 1. Opens (and if needed creates) the area status database
//! 2. Serves the status API (`/update_status`, `/areas`, `/history`, `/health`)
//! 3. Prunes the reading log past its retention window
//!
//! Detection agents post readings to it; it never talks to cameras itself.

use anyhow::Result;
use std::sync::mpsc;

use cams::api::{ApiConfig, ApiServer};
use cams::config::CamsdConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CamsdConfig::load()?;
    let monitor_cfg = config.monitor_config();

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, monitor_cfg.clone()).spawn()?;
    log::info!("status api listening on {}", api_handle.addr);
    log::info!(
        "camsd v{} serving {} (reading log retention {}s)",
        env!("CARGO_PKG_VERSION"),
        monitor_cfg.db_path,
        monitor_cfg.retention.as_secs()
    );
    match monitor_cfg.stale_after {
        Some(stale) => log::info!("readings older than {}s are flagged outdated", stale.as_secs()),
        None => log::info!("staleness flag disabled"),
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("camsd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping status api...");
    api_handle.stop()?;

    Ok(())
}
