//! # Scheduler Module
//!
//! Implements the per-IP request scheduler that admits URLs for fetching.
//!
//! ## Overview
//!
//! A `RequestScheduler` owns the admission policy for one IP address: a
//! minimum inter-request delay, a cap on simultaneously outstanding
//! connections, and fair selection across the per-host queues feeding it.
//! It uses an actor-like design with an internal message loop so that every
//! state transition (enqueue, admission, timer re-arm, connection release)
//! is serialized on one task.
//!
//! ## Admission
//!
//! Each tick the scheduler checks, in order: connection availability, the
//! per-IP delay gate, and then scans the host queues once. The queue whose
//! session is most overdue (minimum non-positive wait) is selected and its
//! head item admitted; the minimum strictly-positive wait across the rest
//! becomes the next wake-up. Queues are scanned in host insertion order,
//! which is stable for the lifetime of the scheduler; the first queue
//! encountered wins ties.
//!
//! ## Timer discipline
//!
//! The loop holds at most one pending deadline. When connections are
//! exhausted the deadline is dropped entirely and the loop waits for a
//! `request_end` notification instead, re-evaluating on the next message.
//!
//! ## Example
//!
//! ```rust,ignore
//! use politecrawl::{HostSession, RequestScheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = RequestScheduler::new(Duration::from_millis(500), 4);
//! let session = Arc::new(HostSession::new(Duration::from_millis(1000)));
//! let waited_ms = scheduler.schedule(session, url).await?;
//! // ... fetch ...
//! scheduler.request_end().await;
//! ```

use crate::error::CrawlError;
use crate::session::HostSession;
use kanal::{unbounded_async, AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

/// Default minimum interval between two requests to the same IP.
pub const DEFAULT_SCHEDULER_DELAY: Duration = Duration::from_millis(500);
/// Default cap on simultaneously outstanding requests per IP.
pub const DEFAULT_CONNECTION_LIMIT: usize = 4;

enum SchedulerMessage {
    Schedule {
        session: Arc<HostSession>,
        url: Url,
        enqueued_at: Instant,
        admitted: oneshot::Sender<u64>,
    },
    RequestEnd,
    Shutdown,
}

struct QueuedItem {
    url: Url,
    enqueued_at: Instant,
    admitted: oneshot::Sender<u64>,
}

struct HostQueue {
    session: Arc<HostSession>,
    items: VecDeque<QueuedItem>,
}

/// Per-IP admission: inter-request delay, connection cap, and fair
/// multi-host queue selection.
pub struct RequestScheduler {
    delay: Duration,
    connection_limit: usize,
    total_requests: AtomicUsize,
    active_requests: AtomicUsize,
    awaiting_requests: AtomicUsize,
    connections_in_use: AtomicUsize,
    last_request: Mutex<Option<Instant>>,
    next_deadline: Mutex<Option<Instant>>,
    tx: AsyncSender<SchedulerMessage>,
}

impl RequestScheduler {
    /// Creates a scheduler and spawns its admission loop.
    ///
    /// Must be called within a Tokio runtime. The loop runs until
    /// [`RequestScheduler::shutdown`] is invoked, which the default
    /// `dispose_scheduler` behavior does on eviction.
    pub fn new(delay: Duration, connection_limit: usize) -> Arc<Self> {
        let (tx, rx) = unbounded_async();
        let scheduler = Arc::new(RequestScheduler {
            delay,
            connection_limit: connection_limit.max(1),
            total_requests: AtomicUsize::new(0),
            active_requests: AtomicUsize::new(0),
            awaiting_requests: AtomicUsize::new(0),
            connections_in_use: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            next_deadline: Mutex::new(None),
            tx,
        });

        let scheduler_clone = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler_clone.run_loop(rx).await;
        });

        scheduler
    }

    async fn run_loop(self: Arc<Self>, rx: AsyncReceiver<SchedulerMessage>) {
        trace!(
            delay_ms = self.delay.as_millis() as u64,
            connection_limit = self.connection_limit,
            "scheduler loop started"
        );
        let mut queues: HashMap<String, HostQueue> = HashMap::new();
        // Host insertion order; the queue scan follows it so tie-breaking
        // is deterministic for the lifetime of the scheduler.
        let mut order: Vec<String> = Vec::new();
        let mut deadline: Option<Instant> = None;
        let mut blocked_on_conn = false;

        loop {
            let msg = match (blocked_on_conn, deadline) {
                (false, Some(at)) => tokio::select! {
                    res = rx.recv() => match res {
                        Ok(msg) => Some(msg),
                        Err(_) => break,
                    },
                    _ = tokio::time::sleep_until(at) => None,
                },
                _ => match rx.recv().await {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };

            match msg {
                Some(SchedulerMessage::Schedule {
                    session,
                    url,
                    enqueued_at,
                    admitted,
                }) => {
                    let host = url.host_str().unwrap_or_default().to_string();
                    trace!("queueing {} under host {}", url, host);
                    let item = QueuedItem {
                        url,
                        enqueued_at,
                        admitted,
                    };
                    match queues.entry(host.clone()) {
                        std::collections::hash_map::Entry::Occupied(mut e) => {
                            e.get_mut().items.push_back(item);
                        }
                        std::collections::hash_map::Entry::Vacant(e) => {
                            order.push(host);
                            e.insert(HostQueue {
                                session,
                                items: VecDeque::from([item]),
                            });
                        }
                    }
                    // Recomputing the deadline from scratch implements the
                    // re-arming rule: an earlier-ready queue pulls the
                    // timer forward. While blocked on a connection nothing
                    // can be admitted, so the new item just waits.
                    if !blocked_on_conn {
                        (deadline, blocked_on_conn) = self.tick(&mut queues, &mut order);
                    }
                }
                Some(SchedulerMessage::RequestEnd) => {
                    blocked_on_conn = false;
                    (deadline, blocked_on_conn) = self.tick(&mut queues, &mut order);
                }
                Some(SchedulerMessage::Shutdown) => {
                    debug!("scheduler received shutdown signal");
                    break;
                }
                None => {
                    (deadline, blocked_on_conn) = self.tick(&mut queues, &mut order);
                }
            }

            *self.next_deadline.lock() = deadline;
        }

        *self.next_deadline.lock() = None;
        trace!(
            pending = self.awaiting_requests.load(Ordering::SeqCst),
            "scheduler loop finished"
        );
        // Dropping the queues drops the admitted senders; pending
        // `schedule` callers observe `SchedulerStopped`.
    }

    /// One admission pass. Returns the next deadline and whether the loop
    /// should wait for a freed connection instead of a timer.
    fn tick(
        &self,
        queues: &mut HashMap<String, HostQueue>,
        order: &mut Vec<String>,
    ) -> (Option<Instant>, bool) {
        let now = Instant::now();
        let in_use = self.connections_in_use.load(Ordering::SeqCst);
        let available = self.connection_limit.saturating_sub(in_use);
        if available == 0 {
            trace!("connection limit reached, waiting for request_end");
            return (None, true);
        }

        if let Some(last) = *self.last_request.lock() {
            let ready = last + self.delay;
            if ready > now {
                return (Some(ready), false);
            }
        }

        if self.awaiting_requests.load(Ordering::SeqCst) == 0 {
            return (None, false);
        }

        let mut selected: Option<usize> = None;
        let mut best_wait = 0i64;
        let mut next_wake: Option<i64> = None;
        for (idx, host) in order.iter().enumerate() {
            let Some(queue) = queues.get(host) else {
                continue;
            };
            let wait = queue.session.signed_wait_at(now);
            if wait <= 0 {
                if selected.is_none() || wait < best_wait {
                    selected = Some(idx);
                    best_wait = wait;
                }
            } else {
                next_wake = Some(next_wake.map_or(wait, |w| w.min(wait)));
            }
        }

        let Some(idx) = selected else {
            return match next_wake {
                Some(ms) => (Some(now + Duration::from_millis(ms as u64)), false),
                None => (None, false),
            };
        };

        let host = order[idx].clone();
        let queue = queues
            .get_mut(&host)
            .expect("selected host has a live queue");
        let item = queue
            .items
            .pop_front()
            .expect("selected queue is non-empty");
        let session = Arc::clone(&queue.session);
        if queue.items.is_empty() {
            queues.remove(&host);
            order.remove(idx);
        }

        session.request_begin(now);
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        self.connections_in_use.fetch_add(1, Ordering::SeqCst);
        self.awaiting_requests.fetch_sub(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(now);

        let waited = now.saturating_duration_since(item.enqueued_at).as_millis() as u64;
        trace!(waited_ms = waited, "admitting {}", item.url);
        if item.admitted.send(waited).is_err() {
            debug!("admitted receiver dropped for {}", item.url);
        }

        if available - 1 == 0 {
            return (None, true);
        }
        let wake = match next_wake {
            Some(ms) => Duration::from_millis(ms as u64).max(self.delay),
            None => self.delay,
        };
        (Some(now + wake), false)
    }

    /// Enqueues a URL under its hostname and resolves with the elapsed wait
    /// in milliseconds once the request is admitted.
    pub async fn schedule(&self, session: Arc<HostSession>, url: Url) -> Result<u64, CrawlError> {
        session.request_added();
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        self.awaiting_requests.fetch_add(1, Ordering::SeqCst);

        let (admitted_tx, admitted_rx) = oneshot::channel();
        let message = SchedulerMessage::Schedule {
            session,
            url,
            enqueued_at: Instant::now(),
            admitted: admitted_tx,
        };
        if self.tx.send(message).await.is_err() {
            self.awaiting_requests.fetch_sub(1, Ordering::SeqCst);
            return Err(CrawlError::SchedulerStopped);
        }
        admitted_rx.await.map_err(|_| CrawlError::SchedulerStopped)
    }

    /// Notifies the scheduler that a previously admitted request finished,
    /// freeing its connection.
    pub async fn request_end(&self) {
        self.connections_in_use.fetch_sub(1, Ordering::SeqCst);
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
        if self.tx.send(SchedulerMessage::RequestEnd).await.is_err() {
            warn!("request_end after scheduler loop stopped");
        }
    }

    /// Stops the admission loop. Pending `schedule` callers observe
    /// [`CrawlError::SchedulerStopped`].
    pub async fn shutdown(&self) {
        if self.tx.send(SchedulerMessage::Shutdown).await.is_err() {
            debug!("scheduler loop already stopped");
        }
    }

    /// No active and no awaiting requests; the precondition for eviction.
    pub fn is_empty(&self) -> bool {
        self.active_requests.load(Ordering::SeqCst) == 0
            && self.awaiting_requests.load(Ordering::SeqCst) == 0
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn connection_limit(&self) -> usize {
        self.connection_limit
    }

    pub fn total_requests_count(&self) -> usize {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn active_requests_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub fn awaiting_requests_count(&self) -> usize {
        self.awaiting_requests.load(Ordering::SeqCst)
    }

    pub fn connections_in_use(&self) -> usize {
        self.connections_in_use.load(Ordering::SeqCst)
    }

    /// Connections still available under the limit.
    pub fn available_connections_count(&self) -> usize {
        self.connection_limit
            .saturating_sub(self.connections_in_use.load(Ordering::SeqCst))
    }

    /// The currently armed wake-up time, if any.
    pub fn next_time(&self) -> Option<Instant> {
        *self.next_deadline.lock()
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("delay", &self.delay)
            .field("connection_limit", &self.connection_limit)
            .field("active", &self.active_requests_count())
            .field("awaiting", &self.awaiting_requests_count())
            .field("connections_in_use", &self.connections_in_use())
            .finish()
    }
}
