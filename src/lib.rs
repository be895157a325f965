//! # politecrawl
//!
//! Core engine of a polite web crawler.
//!
//! Transforms a batch of input URLs into a structured archive of fetched
//! pages while honoring per-IP rate limits, per-host crawl delays, bounded
//! connection concurrency, and cooperative redirect handling.
//!
//! ## Example
//!
//! ```rust,ignore
//! use politecrawl::{Behavior, Crawler};
//!
//! struct MyBehavior;
//!
//! #[politecrawl::async_trait]
//! impl Behavior for MyBehavior {
//!     // override any operation; the rest keep their defaults
//! }
//!
//! async fn run() -> anyhow::Result<()> {
//!     let crawler = Crawler::builder().behavior(MyBehavior).build()?;
//!     let report = crawler.crawl(["http://example.com/"]).await;
//!     for entry in report.entries {
//!         println!("{}: {:?}", entry.url, entry.result);
//!     }
//!     println!("{}", crawler.stats());
//!     Ok(())
//! }
//! ```

pub mod behavior;
pub mod builder;
pub mod cache;
pub mod crawler;
pub mod error;
pub mod factory;
pub mod fetch;
pub mod prelude;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod trace;

pub use behavior::{
    Behavior, ContentProcessor, DefaultBehavior, JsonResultBuilder, ProcessorFactory,
    ResultBuilder,
};
pub use builder::{CrawlOptions, CrawlerBuilder};
pub use cache::MemoryPageCache;
pub use crawler::{CrawlEntry, CrawlReport, Crawler, Sequence};
pub use error::{CrawlError, TraceError, MISSING_SCHEDULING_INFO, NO_IP_AVAILABLE};
pub use factory::{DestroyOutcome, DestroySignal, TemporaryFactory};
pub use scheduler::RequestScheduler;
pub use session::{CookieJar, HostSession, RobotsRules};
pub use stats::StatCollector;
pub use trace::{FetchResult, FetchTimings, StageTiming, Trace};

pub use async_trait::async_trait;
pub use dashmap::DashMap;
pub use tokio;
pub use url::Url;
