//! Producer side of the ingest endpoint.
//!
//! A detection agent counts the people in its area and hands every count to a
//! [`Reporter`]. The reporter forwards at most one reading per interval and
//! drops a reading whose send fails; the next interval carries a fresh count.

use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::now_s;

pub const DEFAULT_POST_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(2);

/// Wire shape of `POST /update_status`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Reading {
    pub area: String,
    pub people_count: u32,
    pub timestamp: i64,
}

pub trait ReadingSink {
    fn send(&mut self, reading: &Reading) -> Result<()>;
}

#[cfg(feature = "reporter")]
pub struct HttpSink {
    agent: ureq::Agent,
    url: String,
}

#[cfg(feature = "reporter")]
impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.into(),
        }
    }
}

#[cfg(feature = "reporter")]
impl ReadingSink for HttpSink {
    fn send(&mut self, reading: &Reading) -> Result<()> {
        use anyhow::anyhow;

        let body = serde_json::to_string(reading)?;
        match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("server rejected reading with status {}", code))
            }
            Err(err) => Err(anyhow!("post to {} failed: {}", self.url, err)),
        }
    }
}

/// Lets one event through per `interval`, measured from the last one let
/// through (or from construction).
#[derive(Clone, Debug)]
pub struct Throttle {
    interval: Duration,
    last: Instant,
}

impl Throttle {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last: start,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent,
    Throttled,
    Dropped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub sent: u64,
    pub dropped: u64,
}

pub struct Reporter<S: ReadingSink> {
    area: String,
    sink: S,
    throttle: Throttle,
    stats: ReporterStats,
}

impl<S: ReadingSink> Reporter<S> {
    pub fn new(area: impl Into<String>, sink: S, interval: Duration) -> Self {
        Self::starting_at(area, sink, interval, Instant::now())
    }

    pub fn starting_at(area: impl Into<String>, sink: S, interval: Duration, start: Instant) -> Self {
        Self {
            area: area.into(),
            sink,
            throttle: Throttle::new(interval, start),
            stats: ReporterStats::default(),
        }
    }

    pub fn observe(&mut self, people_count: u32) -> Result<ReportOutcome> {
        let timestamp = now_s()?;
        Ok(self.observe_at(people_count, Instant::now(), timestamp))
    }

    pub fn observe_at(&mut self, people_count: u32, now: Instant, timestamp: i64) -> ReportOutcome {
        if !self.throttle.ready(now) {
            return ReportOutcome::Throttled;
        }
        let reading = Reading {
            area: self.area.clone(),
            people_count,
            timestamp,
        };
        match self.sink.send(&reading) {
            Ok(()) => {
                self.stats.sent += 1;
                log::info!(
                    "reported area={} people_count={}",
                    reading.area,
                    reading.people_count
                );
                ReportOutcome::Sent
            }
            Err(err) => {
                self.stats.dropped += 1;
                log::warn!("dropping reading for {}: {:#}", reading.area, err);
                ReportOutcome::Dropped
            }
        }
    }

    pub fn stats(&self) -> ReporterStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Reading>,
        fail: bool,
    }

    impl ReadingSink for RecordingSink {
        fn send(&mut self, reading: &Reading) -> Result<()> {
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            self.sent.push(reading.clone());
            Ok(())
        }
    }

    #[test]
    fn throttle_waits_a_full_interval_from_start() {
        let start = Instant::now();
        let mut throttle = Throttle::new(Duration::from_secs(10), start);
        assert!(!throttle.ready(start));
        assert!(!throttle.ready(start + Duration::from_secs(9)));
        assert!(throttle.ready(start + Duration::from_secs(10)));
        assert!(!throttle.ready(start + Duration::from_secs(15)));
        assert!(throttle.ready(start + Duration::from_secs(20)));
    }

    #[test]
    fn reporter_sends_at_most_once_per_interval() {
        let start = Instant::now();
        let mut reporter = Reporter::starting_at(
            "Library",
            RecordingSink::default(),
            Duration::from_secs(10),
            start,
        );
        let at = |secs| start + Duration::from_secs(secs);
        assert_eq!(reporter.observe_at(3, at(1), 101), ReportOutcome::Throttled);
        assert_eq!(reporter.observe_at(4, at(10), 110), ReportOutcome::Sent);
        assert_eq!(reporter.observe_at(5, at(12), 112), ReportOutcome::Throttled);
        assert_eq!(reporter.observe_at(6, at(21), 121), ReportOutcome::Sent);

        let sent = &reporter.sink().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            Reading {
                area: "Library".to_string(),
                people_count: 4,
                timestamp: 110,
            }
        );
        assert_eq!(sent[1].people_count, 6);
        assert_eq!(reporter.stats(), ReporterStats { sent: 2, dropped: 0 });
    }

    #[test]
    fn failed_send_is_dropped_not_retried() {
        let start = Instant::now();
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let mut reporter = Reporter::starting_at("Canteen", sink, Duration::from_secs(10), start);
        let at = |secs| start + Duration::from_secs(secs);
        assert_eq!(reporter.observe_at(7, at(10), 10), ReportOutcome::Dropped);
        // the failed attempt still consumed the interval
        assert_eq!(reporter.observe_at(7, at(11), 11), ReportOutcome::Throttled);
        assert_eq!(reporter.stats(), ReporterStats { sent: 0, dropped: 1 });
    }

    #[test]
    fn reading_serializes_to_ingest_shape() {
        let reading = Reading {
            area: "Library".to_string(),
            people_count: 12,
            timestamp: 1_700_000_000,
        };
        assert_eq!(
            serde_json::to_string(&reading).unwrap(),
            r#"{"area":"Library","people_count":12,"timestamp":1700000000}"#
        );
    }
}
