//! cams_admin - database bootstrap and inspection for CAMS
//!
//! `init` creates the schema (optionally wiping the old database and seeding
//! the demo campus areas); `set` records a reading by hand through the same
//! classifier the daemon uses; `list` and `history` print what is stored.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;

use cams::bootstrap::init_database;
use cams::{readable_local_time, AreaOrder, Monitor, MonitorConfig};

#[derive(Parser, Debug)]
#[command(name = "cams_admin", version, about = "Bootstrap and inspect the CAMS database")]
struct Args {
    /// Path to the CAMS database.
    #[arg(long, global = true, env = "CAMS_DB_PATH", default_value = "cams.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema, optionally resetting and seeding it
    Init {
        /// Delete the existing database file first
        #[arg(long)]
        reset: bool,
        /// Insert the demo campus areas
        #[arg(long)]
        seed: bool,
    },

    /// Record a reading for an area
    Set {
        #[arg(long)]
        area: String,
        #[arg(long)]
        count: u32,
        /// Unix timestamp of the reading (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Print the latest status of every area
    List {
        #[arg(long, value_enum, default_value_t = ListOrder::Recent)]
        order: ListOrder,
    },

    /// Print the reading log for one area, newest first
    History {
        #[arg(long)]
        area: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Drop reading-log entries older than the retention window
    Prune {
        #[arg(long, default_value_t = 60 * 60 * 24 * 7)]
        retention_secs: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListOrder {
    Name,
    Recent,
}

impl From<ListOrder> for AreaOrder {
    fn from(order: ListOrder) -> Self {
        match order {
            ListOrder::Name => AreaOrder::Name,
            ListOrder::Recent => AreaOrder::Recent,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Init { reset, seed } => init(&args.db, reset, seed),
        Command::Set {
            area,
            count,
            timestamp,
        } => {
            let mut monitor = open_monitor(&args.db, None)?;
            let stored = monitor.ingest(&area, count, timestamp)?;
            println!(
                "{}: {} people, {} ({})",
                stored.area,
                stored.people_count,
                stored.status,
                readable_local_time(stored.updated_at)
            );
            Ok(())
        }
        Command::List { order } => {
            let mut monitor = open_monitor(&args.db, None)?;
            let rows = monitor.statuses(order.into())?;
            if rows.is_empty() {
                println!("no areas recorded");
                return Ok(());
            }
            println!("{:<24} {:>6}  {:<7} updated", "area", "count", "status");
            for row in rows {
                println!(
                    "{:<24} {:>6}  {:<7} {}",
                    row.area,
                    row.people_count,
                    row.status,
                    readable_local_time(row.updated_at)
                );
            }
            Ok(())
        }
        Command::History { area, limit } => {
            let mut monitor = open_monitor(&args.db, None)?;
            let records = monitor.history(&area, limit)?;
            if records.is_empty() {
                println!("no readings for {}", area);
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:>6}  {}",
                    readable_local_time(record.recorded_at),
                    record.people_count,
                    record.status
                );
            }
            Ok(())
        }
        Command::Prune { retention_secs } => {
            if retention_secs == 0 {
                return Err(anyhow!("retention must be greater than zero"));
            }
            let mut monitor = open_monitor(&args.db, Some(Duration::from_secs(retention_secs)))?;
            let removed = monitor.enforce_retention()?;
            println!("removed {} readings", removed);
            Ok(())
        }
    }
}

fn open_monitor(db: &str, retention: Option<Duration>) -> Result<Monitor> {
    let mut cfg = MonitorConfig {
        db_path: db.to_string(),
        ..MonitorConfig::default()
    };
    if let Some(retention) = retention {
        cfg.retention = retention;
    }
    Monitor::open(&cfg)
}

fn init(db: &str, reset: bool, seed: bool) -> Result<()> {
    let cfg = MonitorConfig {
        db_path: db.to_string(),
        ..MonitorConfig::default()
    };
    let seeded = init_database(&cfg, reset, seed)?;
    if !seeded.is_empty() {
        println!("seeded {} areas", seeded.len());
    }
    println!("database initialized at {}", db);
    Ok(())
}
