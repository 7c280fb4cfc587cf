//! occupancy_reporter - forward occupancy counts to camsd
//!
//! Reads one people count per line on stdin (typically piped from a detector)
//! and posts it to the ingest endpoint at most once per interval. A failed
//! post is logged and dropped.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::{self, BufRead};
use std::time::Duration;

use cams::reporter::{HttpSink, Reading, ReadingSink, Reporter};
use cams::{now_s, validate_area_name};

#[derive(Parser, Debug)]
#[command(author, version, about = "Post occupancy counts to the CAMS status daemon")]
struct Args {
    /// Ingest endpoint of the status daemon.
    #[arg(
        long,
        env = "CAMS_SERVER_URL",
        default_value = "http://127.0.0.1:5000/update_status"
    )]
    server_url: String,

    /// Area this agent reports for.
    #[arg(long, env = "CAMS_AREA")]
    area: String,

    /// Minimum seconds between posts.
    #[arg(long, env = "CAMS_POST_INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,

    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = 2)]
    timeout_secs: u64,

    /// Post this single count immediately and exit.
    #[arg(long)]
    once: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    validate_area_name(&args.area)?;

    let mut sink = HttpSink::new(args.server_url.clone(), Duration::from_secs(args.timeout_secs));

    if let Some(count) = args.once {
        let reading = Reading {
            area: args.area.clone(),
            people_count: count,
            timestamp: now_s()?,
        };
        sink.send(&reading)?;
        println!("posted {} people for {}", count, args.area);
        return Ok(());
    }

    log::info!(
        "reporting {} to {} every {}s",
        args.area,
        args.server_url,
        args.interval_secs
    );
    let mut reporter = Reporter::new(
        args.area.clone(),
        sink,
        Duration::from_secs(args.interval_secs),
    );
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| anyhow!("failed to read stdin: {}", e))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<u32>() {
            Ok(count) => {
                reporter.observe(count)?;
            }
            Err(_) => log::warn!("ignoring non-count input line: {:?}", trimmed),
        }
    }

    let stats = reporter.stats();
    log::info!(
        "input closed: {} readings sent, {} dropped",
        stats.sent,
        stats.dropped
    );
    Ok(())
}
