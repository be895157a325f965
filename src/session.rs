//! Per-hostname crawl state.
//!
//! A [`HostSession`] tracks everything the crawler knows about one hostname:
//! the crawl delay, request counters, the time of the last issued request,
//! the cookie jar shared by all of that host's requests, and the robots
//! allowance hook. Sessions are owned by the session factory; traces and
//! schedulers hold non-owning references.

use crate::error::CrawlError;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::trace;
use url::Url;

/// Default minimum interval between two requests to the same host.
pub const DEFAULT_CRAWL_DELAY: Duration = Duration::from_millis(1000);

/// Robots-derived allowance rules for a host.
///
/// The default session carries no rules and allows everything; a
/// `create_host_session` override can attach rules parsed from robots.txt.
pub trait RobotsRules: Send + Sync {
    fn is_allowed(&self, agent: &str, url: &Url) -> bool;
}

/// Cookie storage shared by all concurrent requests for one host.
///
/// Reads are concurrent, writes serialized. Cookies are kept per host as
/// name/value pairs; attributes past the first `;` are dropped.
#[derive(Default)]
pub struct CookieJar {
    cookies: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl CookieJar {
    /// The `cookie` header value for a URL, or `None` when the jar holds
    /// nothing for its host.
    pub async fn get(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let cookies = self.cookies.read().await;
        let entries = cookies.get(host)?;
        if entries.is_empty() {
            return None;
        }
        Some(
            entries
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Stores `set-cookie` style values for a URL's host.
    pub async fn set(&self, url: &Url, set_cookies: &[String]) {
        let Some(host) = url.host_str() else {
            return;
        };
        let mut cookies = self.cookies.write().await;
        let entries = cookies.entry(host.to_string()).or_default();
        for raw in set_cookies {
            let pair = raw.split(';').next().unwrap_or(raw);
            if let Some((name, value)) = pair.split_once('=') {
                entries.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    /// Number of cookies stored for a host.
    pub async fn len_for(&self, host: &str) -> usize {
        self.cookies
            .read()
            .await
            .get(host)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

/// Per-hostname state: crawl delay, counters, last-request time, cookies,
/// and robots allowance.
pub struct HostSession {
    creation: Instant,
    crawl_delay: Duration,
    total_requests: AtomicUsize,
    active_requests: AtomicUsize,
    awaiting_requests: AtomicUsize,
    last_request: Mutex<Option<Instant>>,
    cookie_jar: CookieJar,
    rules: Option<Arc<dyn RobotsRules>>,
}

impl HostSession {
    pub fn new(crawl_delay: Duration) -> Self {
        HostSession {
            creation: Instant::now(),
            crawl_delay,
            total_requests: AtomicUsize::new(0),
            active_requests: AtomicUsize::new(0),
            awaiting_requests: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            cookie_jar: CookieJar::default(),
            rules: None,
        }
    }

    /// Attaches robots-derived rules; the default allows everything.
    pub fn with_rules(mut self, rules: Arc<dyn RobotsRules>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Milliseconds since this session was created.
    pub fn age(&self) -> u64 {
        self.creation.elapsed().as_millis() as u64
    }

    pub fn crawl_delay(&self) -> Duration {
        self.crawl_delay
    }

    /// Time until the next request to this host is permissible; zero when
    /// none is pending.
    pub fn time_to_wait(&self) -> Duration {
        match *self.last_request.lock() {
            Some(last) => (last + self.crawl_delay).saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Signed wait in milliseconds relative to `now`. Negative values mean
    /// the host has been ready for that long; a host never requested is the
    /// most overdue of all.
    pub(crate) fn signed_wait_at(&self, now: Instant) -> i64 {
        match *self.last_request.lock() {
            Some(last) => {
                let ready = last + self.crawl_delay;
                if ready >= now {
                    (ready - now).as_millis() as i64
                } else {
                    -((now - ready).as_millis() as i64)
                }
            }
            None => i64::MIN,
        }
    }

    /// Robots allowance for a URL; allows all when no rules are attached.
    pub fn is_allowed(&self, agent: &str, url: &Url) -> bool {
        self.rules
            .as_ref()
            .map_or(true, |rules| rules.is_allowed(agent, url))
    }

    /// Selects one IP from a resolved list.
    ///
    /// A single-element list is returned as-is. Larger lists are sorted
    /// lexicographically and the first entry is used, except on every 10th
    /// issued request, where a uniformly random entry from the tail is
    /// returned instead so callers can detect per-IP bans.
    pub fn select_ip(&self, ips: &[String]) -> Result<String, CrawlError> {
        if ips.is_empty() {
            return Err(CrawlError::Argument(
                "select_ip requires a non-empty ip list".to_string(),
            ));
        }
        if ips.len() == 1 {
            return Ok(ips[0].clone());
        }
        let mut sorted = ips.to_vec();
        sorted.sort();
        let total = self.total_requests.load(Ordering::SeqCst);
        let awaiting = self.awaiting_requests.load(Ordering::SeqCst);
        let issued = total.saturating_sub(awaiting) + 1;
        let index = if issued % 10 == 0 {
            rand::thread_rng().gen_range(1..sorted.len())
        } else {
            0
        };
        trace!(issued, index, "selected ip {}", sorted[index]);
        Ok(sorted[index].clone())
    }

    /// Registers a request queued for this host.
    pub fn request_added(&self) {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        self.awaiting_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks an awaiting request as active and stamps the last-request time.
    pub fn request_begin(&self, time: Instant) {
        *self.last_request.lock() = Some(time);
        self.awaiting_requests.fetch_sub(1, Ordering::SeqCst);
        self.active_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks an active request as finished.
    pub fn request_end(&self) {
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
    }

    /// No active and no awaiting requests; the precondition for eviction.
    pub fn is_empty(&self) -> bool {
        self.active_requests.load(Ordering::SeqCst) == 0
            && self.awaiting_requests.load(Ordering::SeqCst) == 0
    }

    pub fn total_requests_count(&self) -> usize {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn active_requests_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn awaiting_requests_count(&self) -> usize {
        self.awaiting_requests.load(Ordering::SeqCst)
    }

    pub fn cookie_jar(&self) -> &CookieJar {
        &self.cookie_jar
    }
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("crawl_delay", &self.crawl_delay)
            .field("total", &self.total_requests_count())
            .field("active", &self.active_requests_count())
            .field("awaiting", &self.awaiting_requests_count())
            .finish()
    }
}
