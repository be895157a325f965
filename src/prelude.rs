//! A "prelude" for users of the `politecrawl` crate.
//!
//! Re-exports the most commonly used traits and structs so that they can be
//! easily imported.
//!
//! # Example
//!
//! ```
//! use politecrawl::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    CrawlOptions,
    CrawlReport,
    HostSession,
    RequestScheduler,
    Trace,
    // Core traits
    Behavior,
    ContentProcessor,
    ResultBuilder,
    // Errors
    CrawlError,
    TraceError,
    // Essential re-export for trait implementation
    async_trait,
};
