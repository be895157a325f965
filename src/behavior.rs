//! The named-operation registry the engine drives the pipeline with.
//!
//! Every stage of the crawl workflow calls through the [`Behavior`] trait.
//! Each operation has a default implementation, so an implementer overrides
//! only what they need: swap `fetch_page_content` for a stub in tests, back
//! `load_cached_page`/`store_cached_page` with a real cache, attach robots
//! rules in `create_host_session`, and so on.

use crate::error::CrawlError;
use crate::fetch;
use crate::scheduler::{RequestScheduler, DEFAULT_CONNECTION_LIMIT, DEFAULT_SCHEDULER_DELAY};
use crate::session::{HostSession, DEFAULT_CRAWL_DELAY};
use crate::trace::{FetchResult, Trace};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A streaming consumer of decoded page content.
///
/// Processors are created per fetch from the trace's processor factory, fed
/// every decoded chunk in order, and asked for their output once the body is
/// complete. The output lands in [`FetchResult::processed`] under the
/// processor's name; a processor may publish a `redirect` value to steer the
/// engine (e.g. after spotting a meta refresh).
pub trait ContentProcessor: Send {
    fn name(&self) -> &str;
    fn update(&mut self, chunk: &[u8]);
    fn finish(&mut self) -> Value;
}

/// Creates the processor set for one fetch.
pub type ProcessorFactory = Arc<dyn Fn() -> Vec<Box<dyn ContentProcessor>> + Send + Sync>;

/// Assembles the result entry for one crawl sequence.
#[async_trait]
pub trait ResultBuilder: Send + Sync {
    /// Builds the caller-facing value for a sequence of traces (the parent
    /// trace followed by any redirect children).
    async fn build(&self, sequence: &[Trace]) -> Result<Value>;
}

/// Default builder: one JSON entry per trace.
pub struct JsonResultBuilder;

#[async_trait]
impl ResultBuilder for JsonResultBuilder {
    async fn build(&self, sequence: &[Trace]) -> Result<Value> {
        Ok(Value::Array(sequence.iter().map(Trace::to_entry).collect()))
    }
}

/// The registry of named async operations the engine invokes per stage.
///
/// All operations receive the trace being processed and report failures
/// through `Err`; the engine records those on the trace rather than letting
/// them cross the pipeline boundary.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    /// Resolves the trace's hostname to a list of IP strings. The default
    /// performs a system lookup, preferring A records.
    async fn resolve_host(&self, trace: &Trace) -> Result<Vec<String>> {
        let host = trace
            .url
            .host_str()
            .ok_or_else(|| anyhow!("url `{}` has no host", trace.url))?;
        let addrs: Vec<std::net::SocketAddr> =
            tokio::net::lookup_host((host, 0u16)).await?.collect();
        let v4: Vec<String> = addrs
            .iter()
            .filter(|addr| addr.is_ipv4())
            .map(|addr| addr.ip().to_string())
            .collect();
        if !v4.is_empty() {
            return Ok(v4);
        }
        Ok(addrs.iter().map(|addr| addr.ip().to_string()).collect())
    }

    /// Creates the session for the trace's hostname.
    async fn create_host_session(&self, _trace: &Trace) -> Result<Arc<HostSession>> {
        Ok(Arc::new(HostSession::new(DEFAULT_CRAWL_DELAY)))
    }

    /// Called when a session is evicted from the factory.
    async fn dispose_host_session(&self, host: &str, _session: Arc<HostSession>) -> Result<()> {
        debug!("disposing session for host {host}");
        Ok(())
    }

    /// Creates the scheduler for the trace's selected IP.
    async fn create_scheduler(&self, _trace: &Trace) -> Result<Arc<RequestScheduler>> {
        Ok(RequestScheduler::new(
            DEFAULT_SCHEDULER_DELAY,
            DEFAULT_CONNECTION_LIMIT,
        ))
    }

    /// Called when a scheduler is evicted from the factory.
    async fn dispose_scheduler(&self, ip: &str, scheduler: Arc<RequestScheduler>) -> Result<()> {
        debug!("disposing scheduler for ip {ip}");
        scheduler.shutdown().await;
        Ok(())
    }

    /// Loads a previously stored page for the trace; `None` is a miss.
    async fn load_cached_page(&self, _trace: &Trace) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn store_cached_page(&self, _trace: &Trace) -> Result<()> {
        Ok(())
    }

    /// Loads the cookie set to send with the request; `None` sends whatever
    /// the session jar holds.
    async fn load_cookies(&self, _trace: &Trace) -> Result<Option<String>> {
        Ok(None)
    }

    async fn store_cookies(&self, _trace: &Trace) -> Result<()> {
        Ok(())
    }

    /// Fetches the page. The default issues an HTTP GET with gzip/deflate
    /// decoding and streaming capture bounded by the trace's fetch limit.
    async fn fetch_page_content(&self, trace: &Trace) -> Result<FetchResult> {
        fetch::default_fetch(trace).await
    }

    async fn store_page_content(&self, _trace: &Trace) -> Result<()> {
        Ok(())
    }
}

/// The stock behavior set: every operation at its default.
pub struct DefaultBehavior;

impl Behavior for DefaultBehavior {}

/// Fails fast when a caller wires an operation name that does not exist.
///
/// The behavior surface is a trait, so unknown names cannot arise from safe
/// code; this guards dynamic configuration layers that map names to
/// overrides.
pub fn check_behavior_name(name: &str) -> Result<(), CrawlError> {
    const KNOWN: [&str; 11] = [
        "resolveHost",
        "createHostSession",
        "disposeHostSession",
        "createScheduler",
        "disposeScheduler",
        "loadCachedPage",
        "storeCachedPage",
        "loadCookies",
        "storeCookies",
        "fetchPageContent",
        "storePageContent",
    ];
    if KNOWN.contains(&name) {
        Ok(())
    } else {
        Err(CrawlError::Argument(format!("unknown behavior `{name}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::DEFAULT_FETCH_LIMIT;
    use std::collections::HashMap;
    use url::Url;

    fn trace_for(url: &str) -> Trace {
        Trace::new(
            Url::parse(url).unwrap(),
            &HashMap::new(),
            DEFAULT_FETCH_LIMIT,
        )
    }

    #[tokio::test]
    async fn default_cache_and_cookie_hooks_are_noops() {
        let behavior = DefaultBehavior;
        let trace = trace_for("http://example.com/");
        assert!(behavior.load_cached_page(&trace).await.unwrap().is_none());
        assert!(behavior.load_cookies(&trace).await.unwrap().is_none());
        behavior.store_cached_page(&trace).await.unwrap();
        behavior.store_cookies(&trace).await.unwrap();
        behavior.store_page_content(&trace).await.unwrap();
    }

    #[tokio::test]
    async fn default_session_and_scheduler_carry_spec_defaults() {
        let behavior = DefaultBehavior;
        let trace = trace_for("http://example.com/");
        let session = behavior.create_host_session(&trace).await.unwrap();
        assert_eq!(session.crawl_delay(), std::time::Duration::from_millis(1000));

        let scheduler = behavior.create_scheduler(&trace).await.unwrap();
        assert_eq!(scheduler.delay(), std::time::Duration::from_millis(500));
        assert_eq!(scheduler.connection_limit(), 4);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn json_builder_emits_one_entry_per_trace() {
        let builder = JsonResultBuilder;
        let sequence = vec![trace_for("http://example.com/a"), trace_for("http://example.com/b")];
        let value = builder.build(&sequence).await.unwrap();
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["url"], "http://example.com/a");
        assert_eq!(entries[1]["url"], "http://example.com/b");
    }

    #[test]
    fn unknown_behavior_names_fail_fast() {
        assert!(check_behavior_name("fetchPageContent").is_ok());
        assert!(matches!(
            check_behavior_name("fetchPageContents"),
            Err(CrawlError::Argument(_))
        ));
    }
}
