//! In-memory page cache.
//!
//! An optional backing for the `load_cached_page`/`store_cached_page`
//! behaviors. Entries live in a bounded moka cache keyed by trace id, so a
//! re-crawl of an unchanged URL can skip the network entirely.
//!
//! ```rust,ignore
//! struct CachedBehavior {
//!     pages: MemoryPageCache,
//! }
//!
//! #[async_trait]
//! impl Behavior for CachedBehavior {
//!     async fn load_cached_page(&self, trace: &Trace) -> Result<Option<Value>> {
//!         Ok(self.pages.load(trace).await)
//!     }
//!     async fn store_cached_page(&self, trace: &Trace) -> Result<()> {
//!         self.pages.store(trace).await;
//!         Ok(())
//!     }
//! }
//! ```

use crate::trace::Trace;
use moka::future::Cache;
use serde_json::Value;
use tracing::trace;

const DEFAULT_CAPACITY: u64 = 10_000;

/// Bounded in-memory store of rendered page entries, keyed by trace id.
pub struct MemoryPageCache {
    pages: Cache<String, Value>,
}

impl MemoryPageCache {
    pub fn new(max_entries: u64) -> Self {
        MemoryPageCache {
            pages: Cache::builder().max_capacity(max_entries).build(),
        }
    }

    /// The cached entry for a trace's id, if any.
    pub async fn load(&self, trace: &Trace) -> Option<Value> {
        let hit = self.pages.get(&trace.id).await;
        if hit.is_some() {
            trace!("page cache hit for {}", trace.url);
        }
        hit
    }

    /// Stores the trace's rendered entry; fetchless traces are skipped.
    pub async fn store(&self, trace: &Trace) {
        if trace.response.is_none() {
            return;
        }
        self.pages.insert(trace.id.clone(), trace.to_entry()).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.pages.entry_count()
    }
}

impl Default for MemoryPageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{FetchResult, DEFAULT_FETCH_LIMIT};
    use std::collections::HashMap;
    use url::Url;

    fn trace_with_response(url: &str) -> Trace {
        let mut trace = Trace::new(
            Url::parse(url).unwrap(),
            &HashMap::new(),
            DEFAULT_FETCH_LIMIT,
        );
        trace.response = Some(FetchResult {
            status: 200,
            ..FetchResult::default()
        });
        trace
    }

    #[tokio::test]
    async fn stores_and_loads_by_trace_id() {
        let cache = MemoryPageCache::default();
        let trace = trace_with_response("http://example.com/a");
        assert!(cache.load(&trace).await.is_none());

        cache.store(&trace).await;
        let entry = cache.load(&trace).await.unwrap();
        assert_eq!(entry["url"], "http://example.com/a");

        let other = trace_with_response("http://example.com/b");
        assert!(cache.load(&other).await.is_none());
    }

    #[tokio::test]
    async fn fetchless_traces_are_not_stored() {
        let cache = MemoryPageCache::default();
        let trace = Trace::new(
            Url::parse("http://example.com/a").unwrap(),
            &HashMap::new(),
            DEFAULT_FETCH_LIMIT,
        );
        cache.store(&trace).await;
        assert!(cache.load(&trace).await.is_none());
    }
}
