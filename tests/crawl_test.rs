//! End-to-end crawl tests driving the engine with stub behaviors, so no
//! network access is needed.

use anyhow::{anyhow, Result};
use politecrawl::prelude::*;
use politecrawl::{FetchResult, RequestScheduler};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A page served by the stub: a status, an optional `location` header, and
/// any `set-cookie` headers to emit.
#[derive(Clone)]
struct StubPage {
    status: u16,
    location: Option<String>,
    set_cookies: Vec<String>,
}

impl StubPage {
    fn ok() -> Self {
        StubPage {
            status: 200,
            location: None,
            set_cookies: Vec::new(),
        }
    }

    fn redirect(location: &str) -> Self {
        StubPage {
            status: 301,
            location: Some(location.to_string()),
            set_cookies: Vec::new(),
        }
    }

    fn with_cookies(mut self, cookies: &[&str]) -> Self {
        self.set_cookies = cookies.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// Programmable behavior set: fixed DNS answers, zero-delay sessions and
/// schedulers, and canned fetch responses keyed by URL.
struct StubBehavior {
    ips: Vec<String>,
    pages: HashMap<String, StubPage>,
    fetch_count: Arc<AtomicUsize>,
    /// The `cookie` request header each fetched URL carried, by URL.
    seen_cookies: Arc<Mutex<HashMap<String, Option<String>>>>,
    fail_create_scheduler: Option<String>,
}

impl StubBehavior {
    fn new(ips: &[&str]) -> Self {
        StubBehavior {
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            pages: HashMap::new(),
            fetch_count: Arc::new(AtomicUsize::new(0)),
            seen_cookies: Arc::new(Mutex::new(HashMap::new())),
            fail_create_scheduler: None,
        }
    }

    fn page(mut self, url: &str, page: StubPage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    fn failing_scheduler(mut self, message: &str) -> Self {
        self.fail_create_scheduler = Some(message.to_string());
        self
    }

    fn fetch_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fetch_count)
    }

    fn seen_cookies(&self) -> Arc<Mutex<HashMap<String, Option<String>>>> {
        Arc::clone(&self.seen_cookies)
    }
}

#[async_trait]
impl Behavior for StubBehavior {
    async fn resolve_host(&self, _trace: &Trace) -> Result<Vec<String>> {
        Ok(self.ips.clone())
    }

    async fn create_host_session(&self, _trace: &Trace) -> Result<Arc<HostSession>> {
        Ok(Arc::new(HostSession::new(Duration::ZERO)))
    }

    async fn create_scheduler(&self, _trace: &Trace) -> Result<Arc<RequestScheduler>> {
        match &self.fail_create_scheduler {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(RequestScheduler::new(Duration::ZERO, 4)),
        }
    }

    async fn fetch_page_content(&self, trace: &Trace) -> Result<FetchResult> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.seen_cookies.lock().unwrap().insert(
            trace.url.as_str().to_string(),
            trace.request.get("cookie").cloned(),
        );
        let page = self
            .pages
            .get(trace.url.as_str())
            .cloned()
            .unwrap_or_else(StubPage::ok);
        let status_text = match page.status {
            301 => "Moved Permanently",
            _ => "OK",
        };
        let mut result = FetchResult {
            version: "HTTP/1.1".to_string(),
            status: page.status,
            status_text: status_text.to_string(),
            ..FetchResult::default()
        };
        if let Some(location) = page.location {
            result.add_header("location", location);
        }
        for cookie in page.set_cookies {
            result.add_header("set-cookie", cookie);
        }
        Ok(result)
    }
}

fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn sequence(entry: &politecrawl::CrawlEntry) -> &Vec<Value> {
    entry
        .result
        .as_ref()
        .expect("entry has a result")
        .as_array()
        .expect("default builder emits an array")
}

#[tokio::test]
async fn crawl_returns_entries_in_input_order() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler
        .crawl(["http://a.com/1", "http://b.com/2", "http://c.com/3"])
        .await;
    let urls: Vec<&str> = report.entries.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(urls, vec!["http://a.com/1", "http://b.com/2", "http://c.com/3"]);
    for entry in &report.entries {
        assert!(entry.error.is_none());
        assert_eq!(sequence(entry).len(), 1);
    }
}

#[tokio::test]
async fn trace_id_is_sha1_of_the_canonical_url() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let entry = &report.entries[0];
    assert_eq!(entry.id.as_deref(), Some(sha1_hex("http://g.com/a").as_str()));
    assert_eq!(sequence(entry)[0]["id"], sha1_hex("http://g.com/a"));
}

#[tokio::test]
async fn duplicate_inputs_share_one_fetch() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let fetches = behavior.fetch_count();
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a", "http://g.com/a"]).await;
    assert_eq!(report.entries.len(), 2);
    assert!(report.entries.iter().all(|e| e.error.is_none()));
    assert_eq!(report.entries[0].id, report.entries[1].id);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
        crawler.stats().traces_deduped.load(Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn empty_dns_answer_records_workflow_error() {
    let behavior = StubBehavior::new(&[]);
    let fetches = behavior.fetch_count();
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let traces = sequence(&report.entries[0]);
    assert_eq!(traces.len(), 1);
    let errors = traces[0]["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["kind"], "workflow");
    assert_eq!(errors[0]["code"], -7);
    assert_eq!(traces[0]["ip"], Value::Null);
    assert_eq!(traces[0]["ipList"], serde_json::json!([]));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scheduler_build_failure_records_a_generic_error() {
    let behavior = StubBehavior::new(&["127.0.0.1"]).failing_scheduler("test");
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let traces = sequence(&report.entries[0]);
    assert_eq!(traces.len(), 1);
    let errors = traces[0]["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["kind"], "generic");
    assert_eq!(errors[0]["message"], "test");
    assert_eq!(traces[0]["ip"], "127.0.0.1");
}

#[tokio::test]
async fn redirects_append_child_traces_to_the_sequence() {
    let behavior = StubBehavior::new(&["127.0.0.1"])
        .page("http://g.com/a", StubPage::redirect("/b"))
        .page("http://g.com/b", StubPage::ok());
    let fetches = behavior.fetch_count();
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let traces = sequence(&report.entries[0]);
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0]["url"], "http://g.com/a");
    assert_eq!(traces[0]["redirectLocation"], "/b");
    assert_eq!(traces[1]["url"], "http://g.com/b");
    assert_eq!(traces[1]["redirectLocation"], Value::Null);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    // Same hostname: the child inherits the parent's session.
    let stats = crawler.stats();
    assert_eq!(stats.sessions_built.load(Ordering::SeqCst), 1);
    assert_eq!(stats.redirects_followed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cross_host_redirects_acquire_a_new_session() {
    let behavior = StubBehavior::new(&["127.0.0.1"])
        .page("http://g.com/a", StubPage::redirect("http://h.com/b"))
        .page("http://h.com/b", StubPage::ok());
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let traces = sequence(&report.entries[0]);
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[1]["url"], "http://h.com/b");
    assert_eq!(crawler.stats().sessions_built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn redirect_cycles_terminate_with_an_error() {
    let behavior = StubBehavior::new(&["127.0.0.1"])
        .page("http://g.com/a", StubPage::redirect("/b"))
        .page("http://g.com/b", StubPage::redirect("/a"));
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let traces = sequence(&report.entries[0]);
    assert_eq!(traces.len(), 2);
    let child_errors = traces[1]["errors"].as_array().unwrap();
    assert_eq!(child_errors.len(), 1);
    assert!(child_errors[0]["message"]
        .as_str()
        .unwrap()
        .contains("redirect cycle"));
}

#[tokio::test]
async fn redirect_hop_limit_is_enforced() {
    let mut behavior = StubBehavior::new(&["127.0.0.1"]);
    for hop in 0..6 {
        behavior = behavior.page(
            &format!("http://g.com/{hop}"),
            StubPage::redirect(&format!("/{}", hop + 1)),
        );
    }
    let crawler = Crawler::builder()
        .behavior(behavior)
        .max_redirects(3)
        .build()
        .unwrap();

    let report = crawler.crawl(["http://g.com/0"]).await;
    let traces = sequence(&report.entries[0]);
    // The root plus three followed hops; the last trace carries the error.
    assert_eq!(traces.len(), 4);
    let last_errors = traces[3]["errors"].as_array().unwrap();
    assert!(last_errors[0]["message"]
        .as_str()
        .unwrap()
        .contains("redirect limit"));
}

#[tokio::test]
async fn unparseable_input_yields_an_error_entry() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["not a url", "http://g.com/a"]).await;
    assert_eq!(report.entries.len(), 2);
    let invalid = &report.entries[0];
    assert!(invalid.id.is_none());
    assert!(invalid.result.is_none());
    assert!(invalid.error.as_ref().unwrap().contains("invalid url"));
    assert!(report.entries[1].error.is_none());
}

#[tokio::test]
async fn stage_timings_are_recorded_on_successful_traces() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    let report = crawler.crawl(["http://g.com/a"]).await;
    let timings = &sequence(&report.entries[0])[0]["timings"];
    for stage in [
        "resolveHost",
        "loadCachedPage",
        "createHostSession",
        "createScheduler",
        "loadCookies",
        "scheduling",
        "fetchPageContent",
        "storePageContent",
        "storeCookies",
        "storeCachedPage",
    ] {
        let timing = &timings[stage];
        assert!(timing.is_object(), "missing stage timing for {stage}");
        assert!(timing["end"].as_u64().unwrap() >= timing["start"].as_u64().unwrap());
    }
}

#[tokio::test]
async fn batch_dns_lookups_are_coalesced_per_host() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    crawler
        .crawl(["http://g.com/a", "http://g.com/b", "http://h.com/c"])
        .await;
    assert_eq!(crawler.stats().dns_resolutions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sessions_are_reused_across_crawls_within_the_grace_window() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    crawler.crawl(["http://g.com/a"]).await;
    crawler.crawl(["http://g.com/b"]).await;

    let stats = crawler.stats();
    assert_eq!(stats.sessions_built.load(Ordering::SeqCst), 1);
    assert_eq!(stats.schedulers_built.load(Ordering::SeqCst), 1);
    assert_eq!(stats.fetches_succeeded.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cookies_set_by_one_fetch_ride_on_the_next_same_host_request() {
    let behavior = StubBehavior::new(&["127.0.0.1"]).page(
        "http://g.com/a",
        StubPage::ok().with_cookies(&["sid=abc; Path=/; HttpOnly", "theme=dark"]),
    );
    let seen = behavior.seen_cookies();
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    crawler.crawl(["http://g.com/a"]).await;
    crawler.crawl(["http://g.com/b"]).await;

    let seen = seen.lock().unwrap();
    // The first request went out before anything landed in the jar.
    assert_eq!(seen["http://g.com/a"], None);
    // The second rides the session whose jar absorbed both set-cookie
    // headers, attribute parts stripped.
    assert_eq!(seen["http://g.com/b"].as_deref(), Some("sid=abc; theme=dark"));
}

#[tokio::test]
async fn redirect_children_carry_cookies_set_by_the_parent() {
    let behavior = StubBehavior::new(&["127.0.0.1"])
        .page(
            "http://g.com/a",
            StubPage::redirect("/b").with_cookies(&["sid=abc"]),
        )
        .page("http://g.com/b", StubPage::ok());
    let seen = behavior.seen_cookies();
    let crawler = Crawler::builder().behavior(behavior).build().unwrap();

    crawler.crawl(["http://g.com/a"]).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen["http://g.com/a"], None);
    assert_eq!(seen["http://g.com/b"].as_deref(), Some("sid=abc"));
}

/// Result builder that fails for one specific URL.
struct PickyBuilder;

#[async_trait]
impl ResultBuilder for PickyBuilder {
    async fn build(&self, sequence: &[Trace]) -> Result<Value> {
        if sequence[0].url.path() == "/bad" {
            return Err(anyhow!("builder rejected entry"));
        }
        Ok(Value::Array(sequence.iter().map(Trace::to_entry).collect()))
    }
}

#[tokio::test]
async fn builder_failure_on_one_entry_does_not_prevent_others() {
    let behavior = StubBehavior::new(&["127.0.0.1"]);
    let crawler = Crawler::builder()
        .behavior(behavior)
        .result_builder(PickyBuilder)
        .build()
        .unwrap();

    let report = crawler.crawl(["http://g.com/bad", "http://g.com/good"]).await;
    assert!(report.entries[0].result.is_none());
    assert!(report.entries[0]
        .error
        .as_ref()
        .unwrap()
        .contains("builder rejected entry"));
    assert!(report.entries[1].result.is_some());
    assert!(report.entries[1].error.is_none());
}
