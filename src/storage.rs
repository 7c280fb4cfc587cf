use anyhow::{anyhow, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::collections::BTreeMap;

use crate::{classify, open_db_connection, AreaStatus, OccupancyStatus, ReadingRecord};

/// Ordering for [`AreaStatusStore::list_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AreaOrder {
    /// area name ascending (listing endpoint)
    #[default]
    Name,
    /// most recently updated first (dashboard view)
    Recent,
}

impl AreaOrder {
    pub fn from_query(value: &str) -> Result<Self> {
        match value {
            "name" => Ok(AreaOrder::Name),
            "recent" => Ok(AreaOrder::Recent),
            other => Err(anyhow!("unknown area order '{}'", other)),
        }
    }
}

pub trait AreaStatusStore {
    /// Inserts the row for `status.area` or overwrites count, status and
    /// timestamp of the existing one, and appends the reading to the log.
    /// Both writes land together or not at all.
    fn upsert(&mut self, status: &AreaStatus) -> Result<()>;

    fn list_all(&mut self, order: AreaOrder) -> Result<Vec<AreaStatus>>;

    /// Newest-first reading log for one area.
    fn history(&mut self, area: &str, limit: usize) -> Result<Vec<ReadingRecord>>;

    /// Removes log entries recorded before `cutoff`; returns how many.
    fn prune_history(&mut self, cutoff: i64) -> Result<usize>;
}

pub struct SqliteAreaStatusStore {
    conn: Connection,
}

impl SqliteAreaStatusStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS area_status (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              area TEXT NOT NULL UNIQUE,
              people_count INTEGER NOT NULL,
              status TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS area_readings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              area TEXT NOT NULL,
              people_count INTEGER NOT NULL,
              status TEXT NOT NULL,
              recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_readings_area ON area_readings(area, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_readings_recorded ON area_readings(recorded_at);
            "#,
        )?;
        Ok(())
    }

    /// Empties both tables. Used by the admin reset; the daemon never deletes rows.
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM area_status", [])?;
        tx.execute("DELETE FROM area_readings", [])?;
        tx.commit()?;
        Ok(())
    }
}

fn text_column(row: &Row, idx: usize) -> Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Integer(value) => Some(value.to_string()),
        _ => None,
    })
}

fn integer_column(row: &Row, idx: usize) -> Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(value) => Some(value),
        ValueRef::Real(value) => Some(value as i64),
        _ => None,
    })
}

/// Decodes `(area, people_count, status, timestamp)` columns.
///
/// Databases written by earlier producers hold unvalidated rows: NULL areas
/// or timestamps, negative counts, stale labels. Rows without an area, count
/// or timestamp are skipped; out-of-range counts are clamped and, like
/// unknown labels, reclassified. One bad row never fails the whole listing.
fn decode_row(row: &Row, table: &str) -> Result<Option<(String, u32, OccupancyStatus, i64)>> {
    let area = text_column(row, 0)?;
    let count = integer_column(row, 1)?;
    let label = text_column(row, 2)?;
    let at = integer_column(row, 3)?;

    let (Some(area), Some(count), Some(at)) = (area, count, at) else {
        log::warn!("skipping incomplete {} row", table);
        return Ok(None);
    };
    let people_count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
    let status = if i64::from(people_count) != count {
        log::warn!(
            "{} row for {} has out-of-range count {}; treating as {}",
            table,
            area,
            count,
            people_count
        );
        classify(people_count)
    } else {
        match label.as_deref().map(str::parse::<OccupancyStatus>) {
            Some(Ok(status)) => status,
            _ => {
                log::warn!(
                    "{} row for {} has unknown status {:?}; reclassifying",
                    table,
                    area,
                    label
                );
                classify(people_count)
            }
        }
    };
    Ok(Some((area, people_count, status, at)))
}

fn row_to_status(row: &Row) -> Result<Option<AreaStatus>> {
    Ok(decode_row(row, "area_status")?.map(
        |(area, people_count, status, updated_at)| AreaStatus {
            area,
            people_count,
            status,
            updated_at,
        },
    ))
}

fn row_to_reading(row: &Row) -> Result<Option<ReadingRecord>> {
    Ok(decode_row(row, "area_readings")?.map(
        |(area, people_count, status, recorded_at)| ReadingRecord {
            area,
            people_count,
            status,
            recorded_at,
        },
    ))
}

impl AreaStatusStore for SqliteAreaStatusStore {
    fn upsert(&mut self, status: &AreaStatus) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO area_status (area, people_count, status, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(area) DO UPDATE SET
              people_count = excluded.people_count,
              status = excluded.status,
              updated_at = excluded.updated_at
            "#,
            params![
                status.area,
                status.people_count,
                status.status.as_str(),
                status.updated_at
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO area_readings (area, people_count, status, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                status.area,
                status.people_count,
                status.status.as_str(),
                status.updated_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_all(&mut self, order: AreaOrder) -> Result<Vec<AreaStatus>> {
        let sql = match order {
            AreaOrder::Name => {
                "SELECT area, people_count, status, updated_at FROM area_status ORDER BY area ASC"
            }
            AreaOrder::Recent => {
                "SELECT area, people_count, status, updated_at FROM area_status ORDER BY updated_at DESC, area ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.extend(row_to_status(row)?);
        }
        Ok(out)
    }

    fn history(&mut self, area: &str, limit: usize) -> Result<Vec<ReadingRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT area, people_count, status, recorded_at FROM area_readings
            WHERE area = ?1
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![area, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.extend(row_to_reading(row)?);
        }
        Ok(out)
    }

    fn prune_history(&mut self, cutoff: i64) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM area_readings WHERE recorded_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryAreaStatusStore {
    rows: BTreeMap<String, AreaStatus>,
    readings: Vec<ReadingRecord>,
}

impl AreaStatusStore for InMemoryAreaStatusStore {
    fn upsert(&mut self, status: &AreaStatus) -> Result<()> {
        self.rows.insert(status.area.clone(), status.clone());
        self.readings.push(ReadingRecord::from(status));
        Ok(())
    }

    fn list_all(&mut self, order: AreaOrder) -> Result<Vec<AreaStatus>> {
        let mut out: Vec<AreaStatus> = self.rows.values().cloned().collect();
        if order == AreaOrder::Recent {
            out.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.area.cmp(&b.area))
            });
        }
        Ok(out)
    }

    fn history(&mut self, area: &str, limit: usize) -> Result<Vec<ReadingRecord>> {
        // newest insertion first, so ties on recorded_at keep log order
        let mut out: Vec<ReadingRecord> = self
            .readings
            .iter()
            .rev()
            .filter(|record| record.area == area)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        out.truncate(limit);
        Ok(out)
    }

    fn prune_history(&mut self, cutoff: i64) -> Result<usize> {
        let before = self.readings.len();
        self.readings.retain(|record| record.recorded_at >= cutoff);
        Ok(before - self.readings.len())
    }
}
