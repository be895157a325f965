//! The per-URL workflow record.
//!
//! A [`Trace`] is created when a unique URL enters the crawl and follows that
//! URL through every pipeline stage, accumulating the selected IP, request
//! headers, stage timings, the fetch result, and any errors. Traces hold
//! non-owning references to the session and scheduler they were served by;
//! the factories own those objects.

use crate::error::TraceError;
use crate::scheduler::RequestScheduler;
use crate::session::HostSession;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Stable stage names used as keys in [`Trace::timings`].
pub mod stage {
    pub const RESOLVE_HOST: &str = "resolveHost";
    pub const LOAD_CACHED_PAGE: &str = "loadCachedPage";
    pub const CREATE_HOST_SESSION: &str = "createHostSession";
    pub const CREATE_SCHEDULER: &str = "createScheduler";
    pub const LOAD_COOKIES: &str = "loadCookies";
    pub const SCHEDULING: &str = "scheduling";
    pub const FETCH_PAGE_CONTENT: &str = "fetchPageContent";
    pub const STORE_PAGE_CONTENT: &str = "storePageContent";
    pub const STORE_COOKIES: &str = "storeCookies";
    pub const STORE_CACHED_PAGE: &str = "storeCachedPage";
}

/// Default cap on captured content, in bytes (5 MiB).
pub const DEFAULT_FETCH_LIMIT: u64 = 5 * 1024 * 1024;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hex SHA-1 of the canonical URL string; the stable trace identity.
pub fn trace_id(url: &Url) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Wall-clock start and end of a single pipeline stage, ms since epoch.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StageTiming {
    pub start: u64,
    pub end: u64,
}

/// Transport-level timing breakdown of a fetch, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FetchTimings {
    pub connect: u64,
    pub send: u64,
    pub wait: u64,
    pub receive: u64,
}

/// A response header value; repeated headers collapse into a list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(existing) => {
                *self = HeaderValue::Multiple(vec![std::mem::take(existing), value]);
            }
            HeaderValue::Multiple(values) => values.push(value),
        }
    }

    /// The first value.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(v) => v,
            HeaderValue::Multiple(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values, in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            HeaderValue::Single(v) => std::slice::from_ref(v).iter(),
            HeaderValue::Multiple(vs) => vs.iter(),
        }
        .map(String::as_str)
    }
}

/// The outcome of `fetch_page_content`, shaped for the result builder.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub version: String,
    pub status: u16,
    pub status_text: String,
    /// Lower-cased header names; repeated headers become lists.
    pub headers: HashMap<String, HeaderValue>,
    /// Bytes received on the wire, before decoding.
    pub received_size: u64,
    /// Bytes after content decoding.
    pub logical_size: u64,
    /// Decoded content fragments, capped at the trace's fetch limit.
    #[serde(skip)]
    pub content: Vec<Bytes>,
    /// Free-form outputs of the content processors.
    pub processed: serde_json::Map<String, Value>,
    pub timings: FetchTimings,
}

impl FetchResult {
    /// Records a response header under its lower-cased name.
    pub fn add_header(&mut self, name: &str, value: String) {
        match self.headers.entry(name.to_ascii_lowercase()) {
            std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().push(value),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(HeaderValue::Single(value));
            }
        }
    }

    /// First value of a header, by lower-cased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(HeaderValue::first)
    }

    /// Whether the response is an HTTP redirect the engine should follow.
    pub fn is_redirect(&self) -> bool {
        self.redirect_target().is_some()
    }

    /// Redirect target: the `location` header of a 301/302 response, or a
    /// processor-published `redirect` value.
    pub fn redirect_target(&self) -> Option<&str> {
        if matches!(self.status, 301 | 302) {
            if let Some(location) = self.header("location") {
                return Some(location);
            }
        }
        self.processed.get("redirect").and_then(Value::as_str)
    }
}

/// Request headers every trace starts from; caller options merge on top.
pub fn default_request_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(
        "user-agent".to_string(),
        concat!("politecrawl/", env!("CARGO_PKG_VERSION")).to_string(),
    );
    headers.insert(
        "accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
    );
    headers.insert("accept-language".to_string(), "en".to_string());
    headers.insert("accept-charset".to_string(), "utf-8".to_string());
    headers
}

/// The per-URL record threaded through the pipeline.
#[derive(Clone)]
pub struct Trace {
    /// Hex SHA-1 of the canonical URL; stable identity.
    pub id: String,
    /// Canonical URL.
    pub url: Url,
    /// Selected IP, unset until preparation completes. Always a member of
    /// `ip_list` once set.
    pub ip: Option<String>,
    /// Creation timestamp, ms since epoch.
    pub start: u64,
    /// Outgoing request headers.
    pub request: HashMap<String, String>,
    /// Cap on captured content bytes for this trace.
    pub fetch_limit: u64,
    /// Fetch result, set by the schedule stage.
    pub response: Option<FetchResult>,
    /// Ordered failures; non-empty stops downstream stages.
    pub errors: Vec<TraceError>,
    /// Per-stage wall-clock timings, keyed by [`stage`] names.
    pub timings: HashMap<&'static str, StageTiming>,
    /// IPs returned by host resolution.
    pub ip_list: Vec<String>,
    /// Session serving this trace's hostname. The factory owns it.
    pub session: Option<Arc<HostSession>>,
    /// Scheduler serving this trace's IP. The factory owns it.
    pub scheduler: Option<Arc<RequestScheduler>>,
    /// Target of a redirect response, if any.
    pub redirect_location: Option<String>,
    /// Cached page produced by `load_cached_page` on a hit.
    pub cached: Option<Value>,
    /// Factory for per-fetch content processors.
    pub processors: Option<crate::behavior::ProcessorFactory>,
    /// Caller extensions merged from the crawl options.
    pub extensions: serde_json::Map<String, Value>,
}

impl Trace {
    /// Creates a trace for a canonical URL, merging `headers` over the
    /// defaults.
    pub fn new(url: Url, headers: &HashMap<String, String>, fetch_limit: u64) -> Self {
        let mut request = default_request_headers();
        for (name, value) in headers {
            request.insert(name.to_ascii_lowercase(), value.clone());
        }
        Trace {
            id: trace_id(&url),
            url,
            ip: None,
            start: now_millis(),
            request,
            fetch_limit,
            response: None,
            errors: Vec::new(),
            timings: HashMap::new(),
            ip_list: Vec::new(),
            session: None,
            scheduler: None,
            redirect_location: None,
            cached: None,
            processors: None,
            extensions: serde_json::Map::new(),
        }
    }

    /// Marks the start of a stage.
    pub fn begin_stage(&mut self, name: &'static str) {
        let now = now_millis();
        self.timings.insert(
            name,
            StageTiming {
                start: now,
                end: now,
            },
        );
    }

    /// Marks the end of a stage.
    pub fn finish_stage(&mut self, name: &'static str) {
        let now = now_millis();
        if let Some(timing) = self.timings.get_mut(name) {
            timing.end = now.max(timing.start);
        }
    }

    /// Records a stage timing measured externally.
    pub fn record_stage(&mut self, name: &'static str, start: u64, end: u64) {
        self.timings.insert(
            name,
            StageTiming {
                start,
                end: end.max(start),
            },
        );
    }

    pub fn add_workflow_error(&mut self, code: i32, message: impl Into<String>) {
        self.errors.push(TraceError::workflow(code, message));
    }

    pub fn add_generic_error(&mut self, message: impl Into<String>) {
        self.errors.push(TraceError::generic(message));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Renders the trace as a JSON entry for result builders.
    pub fn to_entry(&self) -> Value {
        let response = self.response.as_ref().map(|r| {
            serde_json::to_value(r).unwrap_or(Value::Null)
        });
        serde_json::json!({
            "id": self.id,
            "url": self.url.as_str(),
            "ip": self.ip,
            "ipList": self.ip_list,
            "start": self.start,
            "request": self.request,
            "response": response,
            "errors": self.errors,
            "timings": self.timings,
            "redirectLocation": self.redirect_location,
            "cached": self.cached.is_some(),
        })
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("ip", &self.ip)
            .field("ip_list", &self.ip_list)
            .field("errors", &self.errors)
            .field("redirect_location", &self.redirect_location)
            .finish_non_exhaustive()
    }
}
