//! # Builder Module
//!
//! Provides `CrawlerBuilder`, a fluent API for constructing a configured
//! [`Crawler`], and `CrawlOptions`, the per-crawl settings merged onto each
//! trace.
//!
//! ## Example
//!
//! ```rust,ignore
//! use politecrawl::CrawlerBuilder;
//!
//! let crawler = CrawlerBuilder::new()
//!     .fetch_limit(1024 * 1024)
//!     .header("user-agent", "mybot/1.0")
//!     .max_redirects(5)
//!     .build()?;
//! let report = crawler.crawl(["http://example.com/"]).await;
//! ```

use crate::behavior::{Behavior, DefaultBehavior, ProcessorFactory, ResultBuilder};
use crate::crawler::Crawler;
use crate::error::CrawlError;
use crate::trace::DEFAULT_FETCH_LIMIT;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default eviction grace window for host sessions.
pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_millis(1000);
/// Default eviction grace window for request schedulers.
pub const DEFAULT_SCHEDULER_GRACE: Duration = Duration::from_millis(500);
/// Default cap on redirect hops per crawl sequence.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Per-crawl configuration merged onto every trace.
#[derive(Clone)]
pub struct CrawlOptions {
    /// Cap on captured content bytes per fetch.
    pub fetch_limit: u64,
    /// Request headers merged over the built-in defaults.
    pub headers: HashMap<String, String>,
    /// Eviction grace window captured when a session is acquired.
    pub session_grace: Duration,
    /// Eviction grace window captured when a scheduler is acquired.
    pub scheduler_grace: Duration,
    /// Redirect hop limit per crawl sequence.
    pub max_redirects: usize,
    /// Factory producing the content processors run per fetch.
    pub processors: Option<ProcessorFactory>,
    /// Result assembler; defaults to the JSON entry builder.
    pub builder: Option<Arc<dyn ResultBuilder>>,
    /// Arbitrary caller fields carried onto each trace.
    pub extensions: serde_json::Map<String, Value>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        CrawlOptions {
            fetch_limit: DEFAULT_FETCH_LIMIT,
            headers: HashMap::new(),
            session_grace: DEFAULT_SESSION_GRACE,
            scheduler_grace: DEFAULT_SCHEDULER_GRACE,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            processors: None,
            builder: None,
            extensions: serde_json::Map::new(),
        }
    }
}

impl std::fmt::Debug for CrawlOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlOptions")
            .field("fetch_limit", &self.fetch_limit)
            .field("headers", &self.headers)
            .field("session_grace", &self.session_grace)
            .field("scheduler_grace", &self.scheduler_grace)
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}

/// Fluent construction of a [`Crawler`].
pub struct CrawlerBuilder {
    behavior: Option<Arc<dyn Behavior>>,
    options: CrawlOptions,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        CrawlerBuilder {
            behavior: None,
            options: CrawlOptions::default(),
        }
    }
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the behavior set; unset operations keep their defaults.
    pub fn behavior<B: Behavior>(mut self, behavior: B) -> Self {
        self.behavior = Some(Arc::new(behavior));
        self
    }

    /// Sets the content capture cap per fetch.
    pub fn fetch_limit(mut self, limit: u64) -> Self {
        self.options.fetch_limit = limit;
        self
    }

    /// Adds a request header merged over the defaults.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Sets the session eviction grace window.
    pub fn session_grace(mut self, grace: Duration) -> Self {
        self.options.session_grace = grace;
        self
    }

    /// Sets the scheduler eviction grace window.
    pub fn scheduler_grace(mut self, grace: Duration) -> Self {
        self.options.scheduler_grace = grace;
        self
    }

    /// Sets the redirect hop limit.
    pub fn max_redirects(mut self, limit: usize) -> Self {
        self.options.max_redirects = limit;
        self
    }

    /// Installs the per-fetch content processor factory.
    pub fn processors(mut self, factory: ProcessorFactory) -> Self {
        self.options.processors = Some(factory);
        self
    }

    /// Installs the result assembler.
    pub fn result_builder<R: ResultBuilder + 'static>(mut self, builder: R) -> Self {
        self.options.builder = Some(Arc::new(builder));
        self
    }

    /// Adds a caller extension field carried onto each trace.
    pub fn extension(mut self, name: impl Into<String>, value: Value) -> Self {
        self.options.extensions.insert(name.into(), value);
        self
    }

    /// Validates the configuration and builds the crawler.
    pub fn build(self) -> Result<Crawler, CrawlError> {
        if self.options.fetch_limit == 0 {
            return Err(CrawlError::Configuration(
                "fetch_limit must be greater than 0".to_string(),
            ));
        }
        if self.options.session_grace.is_zero() || self.options.scheduler_grace.is_zero() {
            return Err(CrawlError::Configuration(
                "eviction grace windows must be greater than 0".to_string(),
            ));
        }
        let behavior = self
            .behavior
            .unwrap_or_else(|| Arc::new(DefaultBehavior));
        Ok(Crawler::new(behavior, self.options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_match_the_documented_values() {
        let options = CrawlOptions::default();
        assert_eq!(options.fetch_limit, 5 * 1024 * 1024);
        assert_eq!(options.session_grace, Duration::from_millis(1000));
        assert_eq!(options.scheduler_grace, Duration::from_millis(500));
        assert_eq!(options.max_redirects, 10);
    }

    #[tokio::test]
    async fn zero_fetch_limit_is_rejected() {
        let result = CrawlerBuilder::new().fetch_limit(0).build();
        assert!(matches!(result, Err(CrawlError::Configuration(_))));
    }

    #[tokio::test]
    async fn zero_grace_window_is_rejected() {
        let result = CrawlerBuilder::new()
            .session_grace(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(CrawlError::Configuration(_))));
    }

    #[tokio::test]
    async fn header_names_are_lowercased() {
        let crawler = CrawlerBuilder::new()
            .header("User-Agent", "mybot/1.0")
            .build()
            .unwrap();
        assert_eq!(
            crawler.options().headers.get("user-agent").unwrap(),
            "mybot/1.0"
        );
    }
}
