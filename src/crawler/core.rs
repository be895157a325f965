//! The crawl engine.
//!
//! `Crawler` composes the behavior registry, the session and scheduler
//! factories, the global in-flight dedup map, and the statistics collector.
//! `crawl` fans the input batch out through the pipeline and assembles the
//! results in input order.

use crate::behavior::{Behavior, JsonResultBuilder, ResultBuilder};
use crate::builder::{CrawlOptions, CrawlerBuilder};
use crate::error::CrawlError;
use crate::factory::TemporaryFactory;
use crate::scheduler::RequestScheduler;
use crate::session::HostSession;
use crate::stats::StatCollector;
use crate::trace::{trace_id, Trace};
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use url::Url;

/// A completed crawl sequence: the parent trace followed by any redirect
/// children. Shared between deduplicated requesters.
pub type Sequence = Arc<Vec<Trace>>;

pub(crate) type SequenceFuture = Shared<BoxFuture<'static, Sequence>>;

/// Per-batch DNS coalescing: one shared lookup per hostname.
pub(crate) type DnsFuture = Shared<BoxFuture<'static, Result<Vec<String>, String>>>;
pub(crate) type DnsMap = Arc<DashMap<String, DnsFuture>>;

/// State a same-host redirect child inherits from its parent.
pub(crate) struct Inherited {
    pub(crate) ip_list: Vec<String>,
    pub(crate) session: Arc<HostSession>,
}

/// The result entry for one input URL.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlEntry {
    /// The input URL as given.
    pub url: String,
    /// Trace identity, when the input parsed.
    pub id: Option<String>,
    /// The builder's output for the crawl sequence.
    pub result: Option<Value>,
    /// Parse or builder failure, when no result could be produced.
    pub error: Option<String>,
}

/// All entries for one `crawl` invocation, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    pub entries: Vec<CrawlEntry>,
}

enum PendingEntry {
    Sequence {
        url: String,
        id: String,
        sequence: SequenceFuture,
    },
    Invalid {
        url: String,
        error: String,
    },
}

/// The crawl workflow engine. Cheap to clone; clones share the factories,
/// the in-flight map, and the statistics collector.
#[derive(Clone)]
pub struct Crawler {
    pub(crate) behavior: Arc<dyn Behavior>,
    pub(crate) options: CrawlOptions,
    pub(crate) sessions: TemporaryFactory<String, Arc<HostSession>>,
    pub(crate) schedulers: TemporaryFactory<String, Arc<RequestScheduler>>,
    in_flight: Arc<DashMap<String, SequenceFuture>>,
    pub(crate) stats: Arc<StatCollector>,
}

impl Crawler {
    pub(crate) fn new(behavior: Arc<dyn Behavior>, options: CrawlOptions) -> Self {
        let stats = Arc::new(StatCollector::new());

        let sessions = {
            let behavior = Arc::clone(&behavior);
            let stats = Arc::clone(&stats);
            TemporaryFactory::new(move |host: String, session: Arc<HostSession>| {
                let behavior = Arc::clone(&behavior);
                let stats = Arc::clone(&stats);
                async move {
                    stats.increment_sessions_evicted();
                    if let Err(err) = behavior.dispose_host_session(&host, session).await {
                        warn!("dispose_host_session for {host} failed: {err:#}");
                    }
                }
            })
        };

        let schedulers = {
            let behavior = Arc::clone(&behavior);
            let stats = Arc::clone(&stats);
            TemporaryFactory::new(move |ip: String, scheduler: Arc<RequestScheduler>| {
                let behavior = Arc::clone(&behavior);
                let stats = Arc::clone(&stats);
                async move {
                    stats.increment_schedulers_evicted();
                    if let Err(err) = behavior.dispose_scheduler(&ip, scheduler).await {
                        warn!("dispose_scheduler for {ip} failed: {err:#}");
                    }
                }
            })
        };

        Crawler {
            behavior,
            options,
            sessions,
            schedulers,
            in_flight: Arc::new(DashMap::new()),
            stats,
        }
    }

    /// Starts building a crawler.
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
    }

    pub fn options(&self) -> &CrawlOptions {
        &self.options
    }

    /// The statistics collector shared by all clones of this crawler.
    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    /// Crawls a batch of URLs and returns one entry per input, in input
    /// order. Inputs sharing a canonical URL share one crawl sequence.
    pub async fn crawl<I, S>(&self, urls: I) -> CrawlReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let dns: DnsMap = Arc::new(DashMap::new());
        let builder: Arc<dyn ResultBuilder> = self
            .options
            .builder
            .clone()
            .unwrap_or_else(|| Arc::new(JsonResultBuilder));

        let mut pending = Vec::new();
        for input in urls {
            let raw = input.as_ref().to_string();
            self.stats.increment_urls_submitted();
            match Url::parse(&raw) {
                Ok(url) => {
                    let id = trace_id(&url);
                    let sequence =
                        self.sequence_for(url, id.clone(), Arc::clone(&dns), None, Vec::new());
                    pending.push(PendingEntry::Sequence {
                        url: raw,
                        id,
                        sequence,
                    });
                }
                Err(source) => {
                    debug!("rejecting unparseable input `{raw}`");
                    let error = CrawlError::InvalidUrl { url: raw.clone(), source };
                    pending.push(PendingEntry::Invalid {
                        url: raw,
                        error: error.to_string(),
                    });
                }
            }
        }
        info!("crawling {} input urls", pending.len());

        // Drive every sequence to completion before assembling entries, so
        // deduplicated inputs and redirect children all make progress.
        let sequences: Vec<SequenceFuture> = pending
            .iter()
            .filter_map(|entry| match entry {
                PendingEntry::Sequence { sequence, .. } => Some(sequence.clone()),
                PendingEntry::Invalid { .. } => None,
            })
            .collect();
        join_all(sequences).await;

        let mut entries = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                PendingEntry::Sequence { url, id, sequence } => {
                    let sequence = sequence.await;
                    match builder.build(&sequence).await {
                        Ok(result) => entries.push(CrawlEntry {
                            url,
                            id: Some(id),
                            result: Some(result),
                            error: None,
                        }),
                        Err(err) => {
                            // One failed entry must not prevent the others.
                            warn!("result builder failed for {url}: {err:#}");
                            entries.push(CrawlEntry {
                                url,
                                id: Some(id),
                                result: None,
                                error: Some(err.to_string()),
                            });
                        }
                    }
                }
                PendingEntry::Invalid { url, error } => {
                    entries.push(CrawlEntry {
                        url,
                        id: None,
                        result: None,
                        error: Some(error),
                    });
                }
            }
        }
        CrawlReport { entries }
    }

    /// Crawls with one-off options, sharing this crawler's factories,
    /// dedup map, and statistics.
    pub async fn crawl_with<I, S>(&self, urls: I, options: CrawlOptions) -> CrawlReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let engine = Crawler {
            options,
            ..self.clone()
        };
        engine.crawl(urls).await
    }

    /// The pending sequence for a trace identity. An in-flight trace with
    /// the same id is joined instead of crawled again; the map is global to
    /// this crawler, so dedup spans concurrent `crawl` invocations.
    pub(crate) fn sequence_for(
        &self,
        url: Url,
        id: String,
        dns: DnsMap,
        inherited: Option<Inherited>,
        ancestry: Vec<String>,
    ) -> SequenceFuture {
        if let Some(existing) = self.in_flight.get(&id) {
            trace!("joining in-flight trace {id}");
            self.stats.increment_traces_deduped();
            return existing.clone();
        }

        let engine = self.clone();
        let sequence_id = id.clone();
        let sequence: SequenceFuture = async move {
            let sequence = engine
                .run_pipeline(url, dns, inherited, ancestry)
                .await;
            engine.in_flight.remove(&sequence_id);
            Arc::new(sequence)
        }
        .boxed()
        .shared();

        match self.in_flight.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                self.stats.increment_traces_deduped();
                existing.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sequence.clone());
                sequence
            }
        }
    }
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("options", &self.options)
            .field("in_flight", &self.in_flight.len())
            .field("sessions", &self.sessions.len())
            .field("schedulers", &self.schedulers.len())
            .finish_non_exhaustive()
    }
}
