//! Keyed cache of async-built objects with delayed, cancellable eviction.
//!
//! The crawler keeps one of these for host sessions (keyed by hostname) and
//! one for request schedulers (keyed by IP). Each cache entry moves through
//! an explicit state machine:
//!
//! ```text
//! (miss) -> Building -> Alive -> Alive + armed eviction -> Destroying -> (gone)
//!                          ^              |
//!                          +--- get() ----+   (resurrection inside the grace window)
//! ```
//!
//! At most one build and one destroy are ever in flight for a key. A `get`
//! arriving while an eviction is armed cancels the timer and returns the
//! cached value; a `get` arriving while the destroy action runs waits for it
//! to finish and then builds anew.

use crate::error::CrawlError;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How a destruction request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The destroy action ran and the entry was removed.
    Destroyed,
    /// A `get` inside the grace window resurrected the entry.
    Cancelled,
}

/// A clonable pending destruction signal.
pub type DestroySignal = Shared<BoxFuture<'static, DestroyOutcome>>;

type BuildShared<V> = Shared<BoxFuture<'static, Result<V, Arc<anyhow::Error>>>>;

struct Eviction {
    cancel: oneshot::Sender<()>,
    signal: DestroySignal,
    epoch: u64,
}

enum Entry<V> {
    Building(BuildShared<V>),
    Alive {
        value: V,
        timeout: Duration,
        eviction: Option<Eviction>,
    },
    Destroying(DestroySignal),
}

struct FactoryInner<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    destroy_action: Box<dyn Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync>,
    epoch: AtomicU64,
}

/// Cache mediating async construction and delayed destruction of keyed
/// objects. Cheap to clone; clones share the cache.
pub struct TemporaryFactory<K, V> {
    inner: Arc<FactoryInner<K, V>>,
}

impl<K, V> Clone for TemporaryFactory<K, V> {
    fn clone(&self) -> Self {
        TemporaryFactory {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TemporaryFactory<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a factory with the action run when an entry is destroyed.
    pub fn new<D, Fut>(destroy_action: D) -> Self
    where
        D: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        TemporaryFactory {
            inner: Arc::new(FactoryInner {
                entries: Mutex::new(HashMap::new()),
                destroy_action: Box::new(move |key, value| destroy_action(key, value).boxed()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a key is present. Presence does not guarantee a subsequent
    /// `get` returns the same instance: a destroy may be in progress.
    pub fn has(&self, key: &K) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Number of cached entries, in any state.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value for `key`, building it with `build` on a
    /// miss. `timeout` is the eviction grace window captured for this entry.
    ///
    /// Concurrent callers share one build. A failed build is removed from
    /// the cache before the error becomes observable. A `get` that lands
    /// while the entry is being destroyed waits for the destroy to finish
    /// and then builds a fresh instance.
    pub async fn get<F, Fut>(&self, timeout: Duration, key: K, build: F) -> Result<V, CrawlError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, anyhow::Error>> + Send + 'static,
    {
        enum Waiter<V> {
            Build { pending: BuildShared<V>, installer: bool },
            Destroying(DestroySignal),
        }

        let mut build = Some(build);
        loop {
            let waiter = {
                let mut entries = self.inner.entries.lock();
                match entries.get_mut(&key) {
                    None => {
                        let build = build.take().expect("build closure consumed at most once");
                        // Creating the future is cheap; it is not polled
                        // while the lock is held.
                        let pending: BuildShared<V> =
                            build().map(|r| r.map_err(Arc::new)).boxed().shared();
                        entries.insert(key.clone(), Entry::Building(pending.clone()));
                        Waiter::Build {
                            pending,
                            installer: true,
                        }
                    }
                    Some(Entry::Building(pending)) => Waiter::Build {
                        pending: pending.clone(),
                        installer: false,
                    },
                    Some(Entry::Alive {
                        value,
                        timeout: stored,
                        eviction,
                    }) => {
                        if let Some(ev) = eviction.take() {
                            trace!("get cancelled a pending eviction");
                            let _ = ev.cancel.send(());
                        }
                        *stored = timeout;
                        return Ok(value.clone());
                    }
                    Some(Entry::Destroying(signal)) => Waiter::Destroying(signal.clone()),
                }
            };

            match waiter {
                Waiter::Build { pending, installer } => match pending.await {
                    Ok(value) => {
                        if installer {
                            let mut entries = self.inner.entries.lock();
                            if let Some(entry) = entries.get_mut(&key) {
                                if matches!(entry, Entry::Building(_)) {
                                    *entry = Entry::Alive {
                                        value: value.clone(),
                                        timeout,
                                        eviction: None,
                                    };
                                }
                            }
                        }
                        return Ok(value);
                    }
                    Err(err) => {
                        if installer {
                            self.inner.entries.lock().remove(&key);
                        }
                        return Err(CrawlError::Build(err));
                    }
                },
                Waiter::Destroying(signal) => {
                    debug!("get waiting behind an in-flight destroy");
                    signal.await;
                }
            }
        }
    }

    /// Arms the delayed destruction of `key` and returns a signal resolving
    /// once the entry is destroyed, or cancelled by a resurrecting `get`.
    ///
    /// The key must be present and its build complete; violating either is
    /// reported immediately. Re-requesting destruction returns the already
    /// armed signal.
    pub fn destroy(&self, key: &K) -> Result<DestroySignal, CrawlError> {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            None => Err(CrawlError::Argument(
                "destroy of a key that is not cached".to_string(),
            )),
            Some(Entry::Building(_)) => Err(CrawlError::Argument(
                "destroy while the build is still in progress".to_string(),
            )),
            Some(Entry::Destroying(signal)) => Ok(signal.clone()),
            Some(Entry::Alive {
                eviction: Some(ev), ..
            }) => Ok(ev.signal.clone()),
            Some(Entry::Alive {
                timeout, eviction, ..
            }) => {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                let (done_tx, done_rx) = oneshot::channel();
                let signal: DestroySignal = done_rx
                    .map(|r| r.unwrap_or(DestroyOutcome::Cancelled))
                    .boxed()
                    .shared();
                let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                *eviction = Some(Eviction {
                    cancel: cancel_tx,
                    signal: signal.clone(),
                    epoch,
                });
                self.spawn_eviction(key.clone(), *timeout, epoch, cancel_rx, done_tx, signal.clone());
                Ok(signal)
            }
        }
    }

    fn spawn_eviction(
        &self,
        key: K,
        timeout: Duration,
        epoch: u64,
        cancel_rx: oneshot::Receiver<()>,
        done_tx: oneshot::Sender<DestroyOutcome>,
        signal: DestroySignal,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel_rx => {
                    let _ = done_tx.send(DestroyOutcome::Cancelled);
                    return;
                }
            }

            // The grace window elapsed. Claim the entry, unless a get
            // resurrected it (and possibly a later destroy re-armed it)
            // between the timer firing and this lock.
            let value = {
                let mut entries = inner.entries.lock();
                let claimed = match entries.get_mut(&key) {
                    Some(Entry::Alive {
                        value,
                        eviction: Some(ev),
                        ..
                    }) if ev.epoch == epoch => Some(value.clone()),
                    _ => None,
                };
                match claimed {
                    Some(value) => {
                        entries.insert(key.clone(), Entry::Destroying(signal));
                        value
                    }
                    None => {
                        let _ = done_tx.send(DestroyOutcome::Cancelled);
                        return;
                    }
                }
            };

            trace!("running destroy action");
            (inner.destroy_action)(key.clone(), value).await;
            inner.entries.lock().remove(&key);
            let _ = done_tx.send(DestroyOutcome::Destroyed);
        });
    }
}
