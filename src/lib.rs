//! Campus Area Monitoring System (CAMS) core
//!
//! Detection agents count the people in a monitored area and report the count
//! here. The core classifies each count into a status label, keeps the latest
//! reading per area, and serves the current snapshot over a small HTTP API.
//!
//! # Module Structure
//!
//! - `storage`: area status table + reading log (SQLite, in-memory)
//! - `api`: HTTP endpoints (`/update_status`, `/areas`, `/history`, `/health`)
//! - `config`: daemon configuration (config file + env overrides)
//! - `bootstrap`: database reset and demo seeding for the admin tool
//! - `reporter`: producer side, throttled posting of counts to the ingest endpoint
//! - Core types: OccupancyStatus, AreaStatus, AreaView, Monitor

use anyhow::{anyhow, Result};
use chrono::{Local, TimeZone};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod reporter;
pub mod storage;

pub use storage::{AreaOrder, AreaStatusStore, InMemoryAreaStatusStore, SqliteAreaStatusStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    // Writers from other connections (admin CLI, a second daemon) wait for the lock.
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

// -------------------- Status Classification --------------------

/// Smallest count classified as `Busy`.
pub const BUSY_MIN_COUNT: u32 = 10;
/// Smallest count classified as `Closed`.
pub const CLOSED_MIN_COUNT: u32 = 30;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OccupancyStatus {
    Empty,
    Open,
    Busy,
    /// Older detection agents wrote "full" for this bucket.
    #[serde(alias = "full")]
    Closed,
}

impl OccupancyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OccupancyStatus::Empty => "empty",
            OccupancyStatus::Open => "open",
            OccupancyStatus::Busy => "busy",
            OccupancyStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for OccupancyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OccupancyStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(OccupancyStatus::Empty),
            "open" => Ok(OccupancyStatus::Open),
            "busy" => Ok(OccupancyStatus::Busy),
            "closed" | "full" => Ok(OccupancyStatus::Closed),
            other => Err(anyhow!("unknown occupancy status '{}'", other)),
        }
    }
}

/// Maps an occupancy count to its status label.
///
/// This is the only place the thresholds live; every ingest path goes
/// through it.
pub fn classify(people_count: u32) -> OccupancyStatus {
    match people_count {
        0 => OccupancyStatus::Empty,
        c if c < BUSY_MIN_COUNT => OccupancyStatus::Open,
        c if c < CLOSED_MIN_COUNT => OccupancyStatus::Busy,
        _ => OccupancyStatus::Closed,
    }
}

// -------------------- Areas --------------------

const MAX_AREA_NAME_LEN: usize = 128;

pub fn validate_area_name(area: &str) -> Result<()> {
    if area.trim().is_empty() {
        return Err(anyhow!("area name must not be empty"));
    }
    if area.len() > MAX_AREA_NAME_LEN {
        return Err(anyhow!("area name exceeds {} bytes", MAX_AREA_NAME_LEN));
    }
    if area.chars().any(char::is_control) {
        return Err(anyhow!("area name must not contain control characters"));
    }
    Ok(())
}

/// Latest accepted reading for one area. One row per area in the store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AreaStatus {
    pub area: String,
    pub people_count: u32,
    pub status: OccupancyStatus,
    /// seconds since epoch of the reading, as reported by the producer
    pub updated_at: i64,
}

impl AreaStatus {
    /// Validates the area name and classifies the count.
    pub fn from_reading(
        area: impl Into<String>,
        people_count: u32,
        updated_at: i64,
    ) -> Result<Self> {
        let area = area.into();
        validate_area_name(&area)?;
        Ok(Self {
            area,
            people_count,
            status: classify(people_count),
            updated_at,
        })
    }
}

/// One entry of the append-only reading log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadingRecord {
    pub area: String,
    pub people_count: u32,
    pub status: OccupancyStatus,
    pub recorded_at: i64,
}

impl From<&AreaStatus> for ReadingRecord {
    fn from(status: &AreaStatus) -> Self {
        Self {
            area: status.area.clone(),
            people_count: status.people_count,
            status: status.status,
            recorded_at: status.updated_at,
        }
    }
}

/// Dashboard-facing shape of an area, as served by `GET /areas`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AreaView {
    pub name: String,
    pub people_count: u32,
    pub status: OccupancyStatus,
    /// local-time rendering of `updated_at` (`YYYY-MM-DD HH:MM:SS`)
    pub time_ago: String,
    pub is_outdated: bool,
}

pub fn readable_local_time(epoch_s: i64) -> String {
    match Local.timestamp_opt(epoch_s, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch_s.to_string(),
    }
}

pub fn now_s() -> Result<i64> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    Ok(i64::try_from(secs)?)
}

// -------------------- Monitor --------------------

const DEFAULT_DB_PATH: &str = "cams.db";
const DEFAULT_RETENTION_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub db_path: String,
    /// how long the reading log keeps entries; pruning removes older ones
    pub retention: Duration,
    /// readings older than this are flagged `is_outdated`; `None` never flags
    pub stale_after: Option<Duration>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            stale_after: None,
        }
    }
}

/// Classifier + store, held for the duration of one request or command.
pub struct Monitor {
    store: Box<dyn AreaStatusStore>,
    retention: Duration,
    stale_after: Option<Duration>,
}

impl Monitor {
    pub fn open(cfg: &MonitorConfig) -> Result<Self> {
        let store = Box::new(SqliteAreaStatusStore::open(&cfg.db_path)?);
        Ok(Self::with_store(cfg, store))
    }

    pub fn with_store(cfg: &MonitorConfig, store: Box<dyn AreaStatusStore>) -> Self {
        Self {
            store,
            retention: cfg.retention,
            stale_after: cfg.stale_after,
        }
    }

    /// Classifies and stores a reading. A missing timestamp means "now".
    ///
    /// Last write wins: a reading with an older timestamp than the stored one
    /// still replaces it.
    pub fn ingest(
        &mut self,
        area: &str,
        people_count: u32,
        timestamp: Option<i64>,
    ) -> Result<AreaStatus> {
        let updated_at = match timestamp {
            Some(ts) => ts,
            None => now_s()?,
        };
        let status = AreaStatus::from_reading(area, people_count, updated_at)?;
        self.store.upsert(&status)?;
        Ok(status)
    }

    pub fn statuses(&mut self, order: AreaOrder) -> Result<Vec<AreaStatus>> {
        self.store.list_all(order)
    }

    pub fn areas(&mut self, order: AreaOrder) -> Result<Vec<AreaView>> {
        let now = now_s()?;
        self.areas_at(order, now)
    }

    pub fn areas_at(&mut self, order: AreaOrder, now: i64) -> Result<Vec<AreaView>> {
        let rows = self.store.list_all(order)?;
        Ok(rows.into_iter().map(|row| self.view(row, now)).collect())
    }

    fn view(&self, row: AreaStatus, now: i64) -> AreaView {
        let is_outdated = self.stale_after.map_or(false, |limit| {
            let limit = i64::try_from(limit.as_secs()).unwrap_or(i64::MAX);
            now.saturating_sub(row.updated_at) > limit
        });
        AreaView {
            time_ago: readable_local_time(row.updated_at),
            name: row.area,
            people_count: row.people_count,
            status: row.status,
            is_outdated,
        }
    }

    pub fn history(&mut self, area: &str, limit: usize) -> Result<Vec<ReadingRecord>> {
        self.store.history(area, limit)
    }

    /// Drops reading-log entries older than the retention window.
    pub fn enforce_retention(&mut self) -> Result<usize> {
        let now = now_s()?;
        self.enforce_retention_at(now)
    }

    pub fn enforce_retention_at(&mut self, now: i64) -> Result<usize> {
        let retention = i64::try_from(self.retention.as_secs())
            .map_err(|_| anyhow!("retention exceeds i64 range"))?;
        self.store.prune_history(now.saturating_sub(retention))
    }
}

// -------------------- Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_monitor(stale_after: Option<Duration>) -> Monitor {
        let cfg = MonitorConfig {
            db_path: ":memory:".to_string(),
            retention: Duration::from_secs(100),
            stale_after,
        };
        Monitor::with_store(&cfg, Box::new(InMemoryAreaStatusStore::default()))
    }

    #[test]
    fn classify_follows_threshold_table() {
        assert_eq!(classify(0), OccupancyStatus::Empty);
        assert_eq!(classify(1), OccupancyStatus::Open);
        assert_eq!(classify(5), OccupancyStatus::Open);
        assert_eq!(classify(9), OccupancyStatus::Open);
        assert_eq!(classify(10), OccupancyStatus::Busy);
        assert_eq!(classify(29), OccupancyStatus::Busy);
        assert_eq!(classify(30), OccupancyStatus::Closed);
        assert_eq!(classify(1000), OccupancyStatus::Closed);
        assert_eq!(classify(u32::MAX), OccupancyStatus::Closed);
    }

    #[test]
    fn status_labels_are_lowercase_on_the_wire() {
        assert_eq!(serde_json::to_string(&OccupancyStatus::Busy).unwrap(), r#""busy""#);
        assert_eq!(OccupancyStatus::Closed.to_string(), "closed");
    }

    #[test]
    fn legacy_full_label_reads_as_closed() {
        assert_eq!("full".parse::<OccupancyStatus>().unwrap(), OccupancyStatus::Closed);
        assert_eq!("Closed".parse::<OccupancyStatus>().unwrap(), OccupancyStatus::Closed);
        let parsed: OccupancyStatus = serde_json::from_str(r#""full""#).unwrap();
        assert_eq!(parsed, OccupancyStatus::Closed);
        assert!("packed".parse::<OccupancyStatus>().is_err());
    }

    #[test]
    fn area_names_must_be_non_blank() {
        assert!(validate_area_name("Library").is_ok());
        assert!(validate_area_name("HOD Room").is_ok());
        assert!(validate_area_name("").is_err());
        assert!(validate_area_name("   ").is_err());
        assert!(validate_area_name("Lab\n2").is_err());
        assert!(validate_area_name(&"x".repeat(MAX_AREA_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn ingest_classifies_and_defaults_timestamp() -> Result<()> {
        let mut monitor = memory_monitor(None);
        let before = now_s()?;
        let stored = monitor.ingest("Canteen", 12, None)?;
        assert_eq!(stored.status, OccupancyStatus::Busy);
        assert!(stored.updated_at >= before);

        let explicit = monitor.ingest("Library", 0, Some(1_700_000_000))?;
        assert_eq!(explicit.updated_at, 1_700_000_000);
        assert_eq!(explicit.status, OccupancyStatus::Empty);
        Ok(())
    }

    #[test]
    fn ingest_rejects_blank_area_without_storing() -> Result<()> {
        let mut monitor = memory_monitor(None);
        assert!(monitor.ingest("  ", 3, Some(10)).is_err());
        assert!(monitor.statuses(AreaOrder::Name)?.is_empty());
        Ok(())
    }

    #[test]
    fn views_are_never_outdated_without_threshold() -> Result<()> {
        let mut monitor = memory_monitor(None);
        monitor.ingest("Library", 4, Some(0))?;
        let views = monitor.areas_at(AreaOrder::Name, 1_000_000)?;
        assert_eq!(views.len(), 1);
        assert!(!views[0].is_outdated);
        assert_eq!(views[0].name, "Library");
        assert_eq!(views[0].status, OccupancyStatus::Open);
        assert_eq!(views[0].time_ago, readable_local_time(0));
        Ok(())
    }

    #[test]
    fn views_flag_readings_past_threshold() -> Result<()> {
        let mut monitor = memory_monitor(Some(Duration::from_secs(60)));
        monitor.ingest("Library", 4, Some(1_000))?;
        monitor.ingest("Canteen", 4, Some(1_030))?;
        let views = monitor.areas_at(AreaOrder::Name, 1_080)?;
        let canteen = views.iter().find(|v| v.name == "Canteen").unwrap();
        let library = views.iter().find(|v| v.name == "Library").unwrap();
        assert!(!canteen.is_outdated);
        assert!(library.is_outdated);
        Ok(())
    }

    #[test]
    fn readable_local_time_has_sqlite_datetime_shape() {
        let text = readable_local_time(1_700_000_000);
        assert_eq!(text.len(), 19);
        assert_eq!(&text[4..5], "-");
        assert_eq!(&text[10..11], " ");
        assert_eq!(&text[13..14], ":");
    }

    #[test]
    fn retention_prunes_old_history_only() -> Result<()> {
        let mut monitor = memory_monitor(None);
        monitor.ingest("Library", 1, Some(100))?;
        monitor.ingest("Library", 2, Some(250))?;
        monitor.ingest("Library", 3, Some(300))?;
        let removed = monitor.enforce_retention_at(320)?;
        assert_eq!(removed, 1);
        let history = monitor.history("Library", 10)?;
        assert_eq!(
            history.iter().map(|r| r.people_count).collect::<Vec<_>>(),
            vec![3, 2]
        );
        // latest status is untouched by pruning
        assert_eq!(monitor.statuses(AreaOrder::Name)?[0].people_count, 3);
        Ok(())
    }
}
