//! Pipeline stages of the crawl workflow.
//!
//! Each stage runs only if the previous one left the trace error-free;
//! every failure is recorded on the trace rather than propagated, and the
//! trace then terminates as a one-element sequence.

use crate::crawler::core::{Crawler, DnsFuture, DnsMap, Inherited};
use crate::error::{MISSING_SCHEDULING_INFO, NO_IP_AVAILABLE};
use crate::trace::{now_millis, stage, trace_id, Trace};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// Runs a future and reports its wall-clock window alongside the value.
async fn timed<T>(fut: impl Future<Output = T>) -> (T, u64, u64) {
    let start = now_millis();
    let value = fut.await;
    (value, start, now_millis())
}

impl Crawler {
    /// Drives one trace through the pipeline, recursing into redirects.
    /// Returns the trace's sequence: itself plus any redirect children.
    /// `ancestry` carries the trace ids of the redirect chain leading here.
    pub(crate) async fn run_pipeline(
        &self,
        url: Url,
        dns: DnsMap,
        inherited: Option<Inherited>,
        ancestry: Vec<String>,
    ) -> Vec<Trace> {
        let mut trace = Trace::new(url, &self.options.headers, self.options.fetch_limit);
        trace.processors = self.options.processors.clone();
        trace.extensions = self.options.extensions.clone();
        self.stats.increment_traces_created();
        debug!("pipeline started for {} ({})", trace.url, trace.id);

        self.prepare(&mut trace, &dns, inherited).await;
        let cached_hit = trace.cached.is_some();
        if !trace.has_errors() && !cached_hit {
            self.init(&mut trace).await;
        }
        if !trace.has_errors() && !cached_hit {
            self.schedule_and_fetch(&mut trace).await;
        }
        if !trace.has_errors() {
            self.complete(&mut trace).await;
        }
        self.request_evictions(&trace);

        if !trace.has_errors() {
            if let Some(location) = trace.redirect_location.clone() {
                if ancestry.len() >= self.options.max_redirects {
                    trace.add_generic_error(format!(
                        "redirect limit of {} hops exceeded",
                        self.options.max_redirects
                    ));
                } else {
                    match trace.url.join(&location) {
                        Ok(target) => {
                            let child_id = trace_id(&target);
                            // Joining an ancestor's own pending sequence
                            // would deadlock; report the cycle instead.
                            if ancestry.contains(&child_id) || child_id == trace.id {
                                trace.add_generic_error(format!(
                                    "redirect cycle detected at {target}"
                                ));
                            } else {
                                debug!("following redirect {} -> {}", trace.url, target);
                                self.stats.increment_redirects_followed();
                                let inherited = self.inheritance_for(&trace, &target);
                                let mut ancestry = ancestry;
                                ancestry.push(trace.id.clone());
                                let child = self.sequence_for(
                                    target, child_id, dns, inherited, ancestry,
                                );
                                let child_sequence = child.await;
                                let mut sequence = vec![trace];
                                sequence.extend(child_sequence.iter().cloned());
                                return sequence;
                            }
                        }
                        Err(err) => trace.add_generic_error(format!(
                            "invalid redirect location `{location}`: {err}"
                        )),
                    }
                }
            }
        }
        vec![trace]
    }

    /// Same-host redirects reuse the parent's resolution and session.
    fn inheritance_for(&self, trace: &Trace, target: &Url) -> Option<Inherited> {
        let session = trace.session.as_ref()?;
        if target.host_str() == trace.url.host_str() {
            Some(Inherited {
                ip_list: trace.ip_list.clone(),
                session: Arc::clone(session),
            })
        } else {
            None
        }
    }

    /// `prepare`: in parallel, resolve the host, load any cached page, and
    /// acquire the host session; then select the IP.
    async fn prepare(&self, trace: &mut Trace, dns: &DnsMap, inherited: Option<Inherited>) {
        let host = trace.url.host_str().unwrap_or_default().to_string();

        if let Some(inherited) = inherited {
            trace.ip_list = inherited.ip_list;
            trace.session = Some(inherited.session);
            let (cached, start, end) = timed(self.behavior.load_cached_page(&*trace)).await;
            trace.record_stage(stage::LOAD_CACHED_PAGE, start, end);
            match cached {
                Ok(value) => trace.cached = value,
                Err(err) => trace.add_generic_error(err.to_string()),
            }
        } else {
            let snapshot = trace.clone();
            let session_build = {
                let behavior = Arc::clone(&self.behavior);
                let stats = Arc::clone(&self.stats);
                let snapshot = snapshot.clone();
                move || async move {
                    stats.increment_sessions_built();
                    behavior.create_host_session(&snapshot).await
                }
            };
            let resolve_fut = timed(self.resolve_coalesced(dns, &host, &snapshot));
            let cached_fut = timed(self.behavior.load_cached_page(&*trace));
            let session_fut = timed(self.sessions.get(
                self.options.session_grace,
                host.clone(),
                session_build,
            ));
            let ((resolved, rs, re), (cached, cs, ce), (session, ss, se)) =
                tokio::join!(resolve_fut, cached_fut, session_fut);

            trace.record_stage(stage::RESOLVE_HOST, rs, re);
            trace.record_stage(stage::LOAD_CACHED_PAGE, cs, ce);
            trace.record_stage(stage::CREATE_HOST_SESSION, ss, se);

            match resolved {
                Ok(ips) => trace.ip_list = ips,
                Err(message) => trace.add_generic_error(message),
            }
            match cached {
                Ok(value) => trace.cached = value,
                Err(err) => trace.add_generic_error(err.to_string()),
            }
            match session {
                Ok(session) => trace.session = Some(session),
                Err(err) => trace.add_generic_error(err.to_string()),
            }
        }

        if trace.has_errors() {
            return;
        }
        if trace.cached.is_some() {
            self.stats.increment_cache_hits();
        }

        if !trace.ip_list.is_empty() {
            if let Some(session) = &trace.session {
                match session.select_ip(&trace.ip_list) {
                    Ok(ip) => trace.ip = Some(ip),
                    Err(err) => trace.add_generic_error(err.to_string()),
                }
            }
        }
        if trace.ip.is_none() && trace.cached.is_none() && !trace.has_errors() {
            trace.add_workflow_error(NO_IP_AVAILABLE, "no ip available after host resolution");
        }
    }

    /// One shared DNS lookup per hostname per batch.
    fn resolve_coalesced(&self, dns: &DnsMap, host: &str, snapshot: &Trace) -> DnsFuture {
        if let Some(existing) = dns.get(host) {
            trace!("coalescing dns lookup for {host}");
            return existing.clone();
        }
        let behavior = Arc::clone(&self.behavior);
        let stats = Arc::clone(&self.stats);
        let snapshot = snapshot.clone();
        let lookup: DnsFuture = async move {
            stats.increment_dns_resolutions();
            behavior
                .resolve_host(&snapshot)
                .await
                .map_err(|err| err.to_string())
        }
        .boxed()
        .shared();
        match dns.entry(host.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(lookup.clone());
                lookup
            }
        }
    }

    /// `init`: in parallel, acquire the scheduler for the selected IP and
    /// load the cookies to send.
    async fn init(&self, trace: &mut Trace) {
        let Some(ip) = trace.ip.clone() else {
            trace.add_workflow_error(
                MISSING_SCHEDULING_INFO,
                "no ip available for request scheduling",
            );
            return;
        };

        let scheduler_build = {
            let behavior = Arc::clone(&self.behavior);
            let stats = Arc::clone(&self.stats);
            let snapshot = trace.clone();
            move || async move {
                stats.increment_schedulers_built();
                behavior.create_scheduler(&snapshot).await
            }
        };
        let scheduler_fut = timed(self.schedulers.get(
            self.options.scheduler_grace,
            ip,
            scheduler_build,
        ));
        let cookies_fut = timed(self.behavior.load_cookies(&*trace));
        let ((scheduler, ss, se), (cookies, cs, ce)) = tokio::join!(scheduler_fut, cookies_fut);

        trace.record_stage(stage::CREATE_SCHEDULER, ss, se);
        trace.record_stage(stage::LOAD_COOKIES, cs, ce);

        match scheduler {
            Ok(scheduler) => trace.scheduler = Some(scheduler),
            Err(err) => trace.add_generic_error(err.to_string()),
        }
        match cookies {
            Ok(Some(cookie)) => {
                trace.request.insert("cookie".to_string(), cookie);
            }
            Ok(None) => {}
            Err(err) => trace.add_generic_error(err.to_string()),
        }
    }

    /// `schedule`: wait for admission, fetch, and settle the session and
    /// scheduler exactly once.
    async fn schedule_and_fetch(&self, trace: &mut Trace) {
        let (Some(session), Some(scheduler)) = (trace.session.clone(), trace.scheduler.clone())
        else {
            trace.add_workflow_error(
                MISSING_SCHEDULING_INFO,
                "missing session or scheduler for request scheduling",
            );
            return;
        };

        let agent = trace.request.get("user-agent").cloned().unwrap_or_default();
        if !session.is_allowed(&agent, &trace.url) {
            trace.add_generic_error(format!("crawling of {} disallowed by robots rules", trace.url));
            return;
        }

        // Session cookies ride along unless a cookie header was already set.
        if !trace.request.contains_key("cookie") {
            if let Some(cookie) = session.cookie_jar().get(&trace.url).await {
                trace.request.insert("cookie".to_string(), cookie);
            }
        }

        self.stats.increment_requests_scheduled();
        trace.begin_stage(stage::SCHEDULING);
        let admitted = scheduler
            .schedule(Arc::clone(&session), trace.url.clone())
            .await;
        trace.finish_stage(stage::SCHEDULING);
        match admitted {
            Ok(waited) => {
                self.stats.increment_requests_admitted();
                trace!(waited_ms = waited, "admitted {}", trace.url);
            }
            Err(err) => {
                trace.add_generic_error(err.to_string());
                return;
            }
        }

        trace.begin_stage(stage::FETCH_PAGE_CONTENT);
        let fetched = self.behavior.fetch_page_content(&*trace).await;
        trace.finish_stage(stage::FETCH_PAGE_CONTENT);

        // Exactly once, whatever the fetch outcome.
        session.request_end();
        scheduler.request_end().await;

        match fetched {
            Ok(result) => {
                self.stats.increment_fetches_succeeded();
                self.stats.record_response_status(result.status);
                self.stats.add_bytes_received(result.received_size as usize);
                if let Some(values) = result.headers.get("set-cookie") {
                    let cookies: Vec<String> = values.iter().map(str::to_string).collect();
                    session.cookie_jar().set(&trace.url, &cookies).await;
                }
                trace.redirect_location = result.redirect_target().map(str::to_string);
                trace.response = Some(result);
            }
            Err(err) => {
                self.stats.increment_fetches_failed();
                trace.add_generic_error(err.to_string());
            }
        }
    }

    /// `complete`: in parallel, run the page, cookie, and cache stores.
    async fn complete(&self, trace: &mut Trace) {
        let page_fut = timed(self.behavior.store_page_content(&*trace));
        let cookies_fut = timed(self.behavior.store_cookies(&*trace));
        let cached_fut = timed(self.behavior.store_cached_page(&*trace));
        let ((page, ps, pe), (cookies, cs, ce), (cached, gs, ge)) =
            tokio::join!(page_fut, cookies_fut, cached_fut);

        trace.record_stage(stage::STORE_PAGE_CONTENT, ps, pe);
        trace.record_stage(stage::STORE_COOKIES, cs, ce);
        trace.record_stage(stage::STORE_CACHED_PAGE, gs, ge);

        for outcome in [page, cookies, cached] {
            if let Err(err) = outcome {
                trace.add_generic_error(err.to_string());
            }
        }
    }

    /// Requests delayed eviction of the trace's session and scheduler once
    /// they drain. A `get` during the grace window cancels the eviction.
    fn request_evictions(&self, trace: &Trace) {
        if let Some(session) = &trace.session {
            if session.is_empty() {
                if let Some(host) = trace.url.host_str() {
                    match self.sessions.destroy(&host.to_string()) {
                        Ok(_) => trace!("session eviction armed for {host}"),
                        Err(err) => trace!("session eviction skipped for {host}: {err}"),
                    }
                }
            }
        }
        if let Some(scheduler) = &trace.scheduler {
            if scheduler.is_empty() {
                if let Some(ip) = &trace.ip {
                    match self.schedulers.destroy(ip) {
                        Ok(_) => trace!("scheduler eviction armed for {ip}"),
                        Err(err) => trace!("scheduler eviction skipped for {ip}: {err}"),
                    }
                }
            }
        }
    }
}
