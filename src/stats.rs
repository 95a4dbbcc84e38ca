//! Throughput counters and the per-topic tally.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::info;

/// Received/sent counters reset on every summary.
#[derive(Debug)]
pub struct IoCounters {
    received: u64,
    sent: u64,
    since: Instant,
}

/// Snapshot produced by [`IoCounters::take_summary`].
#[derive(Debug, Clone, PartialEq)]
pub struct IoSummary {
    pub elapsed: Duration,
    pub received: u64,
    pub sent: u64,
}

impl IoSummary {
    pub fn received_per_sec(&self) -> f64 {
        rate(self.received, self.elapsed)
    }

    pub fn sent_per_sec(&self) -> f64 {
        rate(self.sent, self.elapsed)
    }

    pub fn log(&self) {
        info!(
            elapsed_secs = format!("{:.2}", self.elapsed.as_secs_f64()),
            received = self.received,
            received_rate = format!("{:.2}/s", self.received_per_sec()),
            sent = self.sent,
            sent_rate = format!("{:.2}/s", self.sent_per_sec()),
            "I/O summary"
        );
    }
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

impl Default for IoCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl IoCounters {
    pub fn new() -> Self {
        Self {
            received: 0,
            sent: 0,
            since: Instant::now(),
        }
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Return the counts since the last summary and reset them.
    pub fn take_summary(&mut self) -> IoSummary {
        let now = Instant::now();
        let summary = IoSummary {
            elapsed: now.duration_since(self.since),
            received: self.received,
            sent: self.sent,
        };

        self.received = 0;
        self.sent = 0;
        self.since = now;
        summary
    }
}

/// Cumulative message count per topic.
#[derive(Debug)]
pub struct TopicTally {
    counts: BTreeMap<String, u64>,
    started: Instant,
}

impl Default for TopicTally {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTally {
    pub fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    /// Count one message. `/` in the topic is replaced by `_`.
    pub fn record(&mut self, topic: &str) {
        *self.counts.entry(topic.replace('/', "_")).or_insert(0) += 1;
    }

    pub fn count(&self, topic: &str) -> u64 {
        self.counts
            .get(&topic.replace('/', "_"))
            .copied()
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Topics and counts in topic order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(t, c)| (t.as_str(), *c))
    }

    pub fn running_time(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_summary(&self) {
        info!(
            running_secs = format!("{:.2}", self.running_time().as_secs_f64()),
            topics = self.topic_count(),
            total = self.total(),
            "Cumulative topic message count summary"
        );
        for (topic, count) in self.entries() {
            info!("{} --- {}", count, topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_counters_reset_on_summary() {
        let mut counters = IoCounters::new();
        for _ in 0..5 {
            counters.record_received();
        }
        for _ in 0..3 {
            counters.record_sent();
        }

        let summary = counters.take_summary();
        assert_eq!(summary.received, 5);
        assert_eq!(summary.sent, 3);

        let summary = counters.take_summary();
        assert_eq!(summary.received, 0);
        assert_eq!(summary.sent, 0);
    }

    #[test]
    fn test_io_summary_rates() {
        let summary = IoSummary {
            elapsed: Duration::from_secs(4),
            received: 10,
            sent: 6,
        };
        assert!((summary.received_per_sec() - 2.5).abs() < f64::EPSILON);
        assert!((summary.sent_per_sec() - 1.5).abs() < f64::EPSILON);

        let empty = IoSummary {
            elapsed: Duration::ZERO,
            received: 10,
            sent: 0,
        };
        assert_eq!(empty.received_per_sec(), 0.0);
    }

    #[test]
    fn test_topic_tally_counts() {
        let mut tally = TopicTally::new();
        tally.record("site/a/temp");
        tally.record("site/a/temp");
        tally.record("site/b/temp");

        assert_eq!(tally.count("site/a/temp"), 2);
        assert_eq!(tally.count("site_b_temp"), 1);
        assert_eq!(tally.count("site/c/temp"), 0);
        assert_eq!(tally.topic_count(), 2);
        assert_eq!(tally.total(), 3);

        let entries: Vec<(&str, u64)> = tally.entries().collect();
        assert_eq!(entries, vec![("site_a_temp", 2), ("site_b_temp", 1)]);
    }
}
