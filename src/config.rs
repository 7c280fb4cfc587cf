use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::MonitorConfig;

const DEFAULT_DB_PATH: &str = "cams.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Deserialize, Default)]
struct CamsdConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    retention: Option<RetentionConfigFile>,
    staleness: Option<StalenessConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StalenessConfigFile {
    after_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CamsdConfig {
    pub db_path: String,
    pub api_addr: String,
    /// how long the per-reading log is kept
    pub retention: Duration,
    /// unset means `is_outdated` is always false
    pub stale_after: Option<Duration>,
}

impl CamsdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            db_path: self.db_path.clone(),
            retention: self.retention,
            stale_after: self.stale_after,
        }
    }

    fn from_file(file: CamsdConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let retention = Duration::from_secs(
            file.retention
                .and_then(|retention| retention.seconds)
                .unwrap_or(DEFAULT_RETENTION_SECS),
        );
        let stale_after = file
            .staleness
            .and_then(|staleness| staleness.after_seconds)
            .map(Duration::from_secs);
        Self {
            db_path,
            api_addr,
            retention,
            stale_after,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CAMS_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("CAMS_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(retention) = std::env::var("CAMS_RETENTION_SECS") {
            let seconds: u64 = retention.trim().parse().map_err(|_| {
                anyhow!("CAMS_RETENTION_SECS must be an integer number of seconds")
            })?;
            self.retention = Duration::from_secs(seconds);
        }
        if let Ok(stale) = std::env::var("CAMS_STALE_AFTER_SECS") {
            if !stale.trim().is_empty() {
                let seconds: u64 = stale.trim().parse().map_err(|_| {
                    anyhow!("CAMS_STALE_AFTER_SECS must be an integer number of seconds")
                })?;
                self.stale_after = Some(Duration::from_secs(seconds));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.retention.as_secs() == 0 {
            return Err(anyhow!("retention must be greater than zero"));
        }
        if self.stale_after.map_or(false, |stale| stale.as_secs() == 0) {
            return Err(anyhow!("staleness threshold must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamsdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
