//! # Crawler Module
//!
//! Implements the workflow engine that drives each URL through the crawl
//! pipeline.
//!
//! ## Overview
//!
//! The engine canonicalizes input URLs, deduplicates them by identity,
//! coalesces DNS lookups per batch, and runs each unique URL through the
//! stages `prepare` (resolve, cached-page load, session acquisition),
//! `init` (scheduler acquisition, cookie load), `schedule` (admission and
//! fetch), and `complete` (stores and redirect handling). Sessions and
//! schedulers come from [`TemporaryFactory`](crate::TemporaryFactory)
//! caches and are evicted, after a grace window, once they drain.
//!
//! ## Key Components
//!
//! - **Crawler**: the engine handle; cheap to clone, clones share state
//! - **CrawlReport / CrawlEntry**: the per-input results, in input order
//! - Pipeline stage methods live in the `pipeline` submodule

mod core;
mod pipeline;

pub use core::{CrawlEntry, CrawlReport, Crawler, Sequence};
