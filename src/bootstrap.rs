//! Database bootstrap for `cams_admin init`: reset and demo seeding.

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::{now_s, AreaStatus, Monitor, MonitorConfig};

/// Demo areas with a plausible spread of counts.
pub const SAMPLE_AREAS: &[(&str, u32)] = &[
    ("Library", 28),
    ("Canteen", 21),
    ("HOD Room", 32),
    ("Computer Lab", 12),
    ("Auditorium", 0),
    ("Sports Complex", 5),
];

/// Deletes the database file and its `-wal`/`-shm` sidecars.
/// Returns false when there was no database to remove.
pub fn remove_database(db_path: &Path) -> Result<bool> {
    if !db_path.exists() {
        log::info!("no existing database at {}", db_path.display());
        return Ok(false);
    }
    log::warn!("removing existing database {}", db_path.display());
    std::fs::remove_file(db_path)
        .map_err(|e| anyhow!("failed to remove {}: {}", db_path.display(), e))?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = Path::new(&sidecar);
        if sidecar.exists() {
            std::fs::remove_file(sidecar)
                .map_err(|e| anyhow!("failed to remove {}: {}", sidecar.display(), e))?;
        }
    }
    Ok(true)
}

/// Records every sample area at `now`. Labels come from the classifier.
pub fn seed_sample_areas(monitor: &mut Monitor, now: i64) -> Result<Vec<AreaStatus>> {
    SAMPLE_AREAS
        .iter()
        .map(|(area, count)| {
            let stored = monitor.ingest(area, *count, Some(now))?;
            log::info!(
                "seeded {} ({} people, {})",
                stored.area,
                stored.people_count,
                stored.status
            );
            Ok(stored)
        })
        .collect()
}

/// Creates the schema, optionally wiping the old database first and seeding
/// the sample areas. Returns the seeded rows.
pub fn init_database(cfg: &MonitorConfig, reset: bool, seed: bool) -> Result<Vec<AreaStatus>> {
    if reset {
        remove_database(Path::new(&cfg.db_path))?;
    }
    let mut monitor = Monitor::open(cfg)?;
    log::info!("schema ready in {}", cfg.db_path);
    if !seed {
        return Ok(Vec::new());
    }
    seed_sample_areas(&mut monitor, now_s()?)
}
