use anyhow::Result;
use std::thread;
use tempfile::tempdir;

use cams::{classify, AreaOrder, AreaStatus, AreaStatusStore, SqliteAreaStatusStore};

const WRITES_PER_THREAD: u32 = 25;

/// Each writer holds its own connection, as request handlers do.
#[test]
fn concurrent_writers_never_interleave_fields() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("cams.db").to_string_lossy().to_string();
    drop(SqliteAreaStatusStore::open(&db_path)?);

    let writers: Vec<_> = [(3u32, 1_000i64), (45u32, 2_000i64)]
        .into_iter()
        .map(|(count, base_ts)| {
            let db_path = db_path.clone();
            thread::spawn(move || -> Result<()> {
                let mut store = SqliteAreaStatusStore::open(&db_path)?;
                for i in 0..WRITES_PER_THREAD {
                    let status = AreaStatus::from_reading("Library", count, base_ts + i64::from(i))?;
                    store.upsert(&status)?;
                    let other = AreaStatus::from_reading(format!("Lab {count}"), count, base_ts)?;
                    store.upsert(&other)?;
                }
                Ok(())
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread panicked")?;
    }

    let mut store = SqliteAreaStatusStore::open(&db_path)?;
    let rows = store.list_all(AreaOrder::Name)?;
    let names: Vec<&str> = rows.iter().map(|row| row.area.as_str()).collect();
    assert_eq!(names, vec!["Lab 3", "Lab 45", "Library"]);

    let library = &rows[2];
    // whichever writer landed last, its fields arrive together
    assert_eq!(library.status, classify(library.people_count));
    let expected_base = if library.people_count == 3 { 1_000 } else { 2_000 };
    assert_eq!(
        library.updated_at,
        expected_base + i64::from(WRITES_PER_THREAD - 1)
    );

    let history = store.history("Library", 1_000)?;
    assert_eq!(history.len(), (2 * WRITES_PER_THREAD) as usize);
    Ok(())
}
