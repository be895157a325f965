//! # Statistics Module
//!
//! Collects counters describing a crawler's operation: URLs submitted,
//! traces created and deduplicated, DNS resolutions, session and scheduler
//! lifecycle events, scheduling and fetch outcomes, and the response status
//! distribution.
//!
//! All counters are atomic and updated concurrently by the pipeline; a
//! consistent snapshot backs the `Display` and JSON exports.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

// A consistent snapshot used by the export and display paths.
struct StatsSnapshot {
    urls_submitted: usize,
    traces_created: usize,
    traces_deduped: usize,
    dns_resolutions: usize,
    cache_hits: usize,
    sessions_built: usize,
    sessions_evicted: usize,
    schedulers_built: usize,
    schedulers_evicted: usize,
    requests_scheduled: usize,
    requests_admitted: usize,
    fetches_succeeded: usize,
    fetches_failed: usize,
    redirects_followed: usize,
    bytes_received: usize,
    response_status_counts: HashMap<u16, usize>,
    elapsed: Duration,
}

impl StatsSnapshot {
    fn fetches_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            (self.fetches_succeeded + self.fetches_failed) as f64 / seconds
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        if self.bytes_received >= GB {
            format!("{:.2} GB", self.bytes_received as f64 / GB as f64)
        } else if self.bytes_received >= MB {
            format!("{:.2} MB", self.bytes_received as f64 / MB as f64)
        } else if self.bytes_received >= KB {
            format!("{:.2} KB", self.bytes_received as f64 / KB as f64)
        } else {
            format!("{} B", self.bytes_received)
        }
    }
}

/// Collects and stores statistics about the crawler's operation.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    start_time: Instant,

    pub urls_submitted: AtomicUsize,
    pub traces_created: AtomicUsize,
    pub traces_deduped: AtomicUsize,

    pub dns_resolutions: AtomicUsize,
    pub cache_hits: AtomicUsize,

    pub sessions_built: AtomicUsize,
    pub sessions_evicted: AtomicUsize,
    pub schedulers_built: AtomicUsize,
    pub schedulers_evicted: AtomicUsize,

    pub requests_scheduled: AtomicUsize,
    pub requests_admitted: AtomicUsize,
    pub fetches_succeeded: AtomicUsize,
    pub fetches_failed: AtomicUsize,
    pub redirects_followed: AtomicUsize,
    pub bytes_received: AtomicUsize,

    pub response_status_counts: Arc<dashmap::DashMap<u16, usize>>,
}

impl StatCollector {
    pub(crate) fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            urls_submitted: AtomicUsize::new(0),
            traces_created: AtomicUsize::new(0),
            traces_deduped: AtomicUsize::new(0),
            dns_resolutions: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            sessions_built: AtomicUsize::new(0),
            sessions_evicted: AtomicUsize::new(0),
            schedulers_built: AtomicUsize::new(0),
            schedulers_evicted: AtomicUsize::new(0),
            requests_scheduled: AtomicUsize::new(0),
            requests_admitted: AtomicUsize::new(0),
            fetches_succeeded: AtomicUsize::new(0),
            fetches_failed: AtomicUsize::new(0),
            redirects_followed: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
            response_status_counts: Arc::new(dashmap::DashMap::new()),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut status_counts = HashMap::new();
        for entry in self.response_status_counts.iter() {
            let (status, count) = entry.pair();
            status_counts.insert(*status, *count);
        }

        StatsSnapshot {
            urls_submitted: self.urls_submitted.load(Ordering::SeqCst),
            traces_created: self.traces_created.load(Ordering::SeqCst),
            traces_deduped: self.traces_deduped.load(Ordering::SeqCst),
            dns_resolutions: self.dns_resolutions.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            sessions_built: self.sessions_built.load(Ordering::SeqCst),
            sessions_evicted: self.sessions_evicted.load(Ordering::SeqCst),
            schedulers_built: self.schedulers_built.load(Ordering::SeqCst),
            schedulers_evicted: self.schedulers_evicted.load(Ordering::SeqCst),
            requests_scheduled: self.requests_scheduled.load(Ordering::SeqCst),
            requests_admitted: self.requests_admitted.load(Ordering::SeqCst),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::SeqCst),
            fetches_failed: self.fetches_failed.load(Ordering::SeqCst),
            redirects_followed: self.redirects_followed.load(Ordering::SeqCst),
            bytes_received: self.bytes_received.load(Ordering::SeqCst),
            response_status_counts: status_counts,
            elapsed: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_urls_submitted(&self) {
        self.urls_submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_traces_created(&self) {
        self.traces_created.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_traces_deduped(&self) {
        self.traces_deduped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_dns_resolutions(&self) {
        self.dns_resolutions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_sessions_built(&self) {
        self.sessions_built.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_sessions_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_schedulers_built(&self) {
        self.schedulers_built.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_schedulers_evicted(&self) {
        self.schedulers_evicted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_scheduled(&self) {
        self.requests_scheduled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fetches_succeeded(&self) {
        self.fetches_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fetches_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_redirects_followed(&self) {
        self.redirects_followed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response_status(&self, status: u16) {
        *self.response_status_counts.entry(status).or_insert(0) += 1;
    }

    pub(crate) fn add_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Serializes the current counters as JSON.
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serializes the current counters as pretty-printed JSON.
    pub fn to_json_string_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration   : {:?}", snapshot.elapsed)?;
        writeln!(f, "  speed      : {:.2} fetch/s", snapshot.fetches_per_second())?;
        writeln!(
            f,
            "  urls       : submitted: {}, traces: {}, deduped: {}",
            snapshot.urls_submitted, snapshot.traces_created, snapshot.traces_deduped
        )?;
        writeln!(
            f,
            "  lookups    : dns: {}, cache hits: {}",
            snapshot.dns_resolutions, snapshot.cache_hits
        )?;
        writeln!(
            f,
            "  sessions   : built: {}, evicted: {}",
            snapshot.sessions_built, snapshot.sessions_evicted
        )?;
        writeln!(
            f,
            "  schedulers : built: {}, evicted: {}",
            snapshot.schedulers_built, snapshot.schedulers_evicted
        )?;
        writeln!(
            f,
            "  requests   : scheduled: {}, admitted: {}, ok: {}, fail: {}, redirects: {}",
            snapshot.requests_scheduled,
            snapshot.requests_admitted,
            snapshot.fetches_succeeded,
            snapshot.fetches_failed,
            snapshot.redirects_followed
        )?;
        writeln!(f, "  received   : {}", snapshot.formatted_bytes())?;

        let status_string = if snapshot.response_status_counts.is_empty() {
            "none".to_string()
        } else {
            let mut pairs: Vec<_> = snapshot.response_status_counts.iter().collect();
            pairs.sort_by_key(|(status, _)| **status);
            pairs
                .iter()
                .map(|(status, count)| format!("{status}: {count}"))
                .collect::<Vec<String>>()
                .join(", ")
        };
        writeln!(f, "  status     : {status_string}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = StatCollector::new();
        stats.increment_urls_submitted();
        stats.increment_urls_submitted();
        stats.increment_fetches_succeeded();
        stats.record_response_status(200);
        stats.record_response_status(200);
        stats.record_response_status(404);
        stats.add_bytes_received(2048);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.urls_submitted, 2);
        assert_eq!(snapshot.fetches_succeeded, 1);
        assert_eq!(snapshot.response_status_counts[&200], 2);
        assert_eq!(snapshot.response_status_counts[&404], 1);
        assert_eq!(snapshot.formatted_bytes(), "2.00 KB");
    }

    #[test]
    fn json_export_includes_counters() {
        let stats = StatCollector::new();
        stats.increment_requests_scheduled();
        let json = stats.to_json_string().unwrap();
        assert!(json.contains("\"requests_scheduled\":1"));
    }

    #[test]
    fn display_renders_without_activity() {
        let stats = StatCollector::new();
        let rendered = format!("{stats}");
        assert!(rendered.contains("Crawl Statistics"));
        assert!(rendered.contains("status     : none"));
    }
}
