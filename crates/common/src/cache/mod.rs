//! Single-flight answer cache
//!
//! Provides:
//! - TTL + LRU bounded storage of finalized entries (moka)
//! - Single-flight de-duplication of concurrent computations per key
//! - Progress broadcast so waiters can follow partial output
//! - Cache key builder helpers
//!
//! A computation runs on its own task. Waiters, including the caller that
//! started it, only hold a handle to its outcome: dropping a waiter never
//! cancels the computation, and a finished computation is finalized into
//! the store whether or not anyone is still waiting.

use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::{policy::EvictionPolicy, sync::Cache};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Values stored by the cache decide whether they may outlive the request
pub trait Cacheable {
    /// `false` shares the value with current waiters but skips storage
    fn is_cacheable(&self) -> bool {
        true
    }
}

/// Finalized cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// How a caller's lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Finalized entry found in the store
    Hit,
    /// Joined a computation started by another caller
    Coalesced,
    /// This caller started the computation
    Miss,
}

impl CacheStatus {
    /// True when this caller did not run the computation
    pub fn from_cache(&self) -> bool {
        !matches!(self, CacheStatus::Miss)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Coalesced => "coalesced",
            CacheStatus::Miss => "miss",
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub entry: Arc<CacheEntry<V>>,
    pub status: CacheStatus,
}

impl<V> Lookup<V> {
    pub fn from_cache(&self) -> bool {
        self.status.from_cache()
    }
}

/// Partial output of an in-flight computation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Bumped whenever the computation restarts its output
    pub attempt: u32,
    /// Output accumulated in the current attempt
    pub text: String,
}

/// Write side of a computation's progress channel
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Arc<watch::Sender<Progress>>,
}

impl ProgressSink {
    fn new(tx: watch::Sender<Progress>) -> Self {
        Self { tx: Arc::new(tx) }
    }

    /// A sink nobody observes
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self::new(tx)
    }

    /// Append a chunk of output
    pub fn push(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.tx.send_modify(|progress| progress.text.push_str(chunk));
    }

    /// Discard output produced so far and start a new attempt
    pub fn restart(&self) {
        self.tx.send_modify(|progress| {
            progress.attempt += 1;
            progress.text.clear();
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }
}

type Outcome<V> = std::result::Result<Arc<CacheEntry<V>>, Arc<AppError>>;
type SharedOutcome<V> = Shared<BoxFuture<'static, Outcome<V>>>;

struct InFlight<V> {
    id: u64,
    outcome: SharedOutcome<V>,
    progress: watch::Receiver<Progress>,
}

/// A lookup that may still be waiting on a computation
pub struct Pending<V> {
    key: String,
    state: PendingState<V>,
}

enum PendingState<V> {
    Ready(Arc<CacheEntry<V>>),
    Waiting {
        outcome: SharedOutcome<V>,
        progress: watch::Receiver<Progress>,
        status: CacheStatus,
    },
}

impl<V: Clone + Send + Sync + 'static> Pending<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> CacheStatus {
        match &self.state {
            PendingState::Ready(_) => CacheStatus::Hit,
            PendingState::Waiting { status, .. } => *status,
        }
    }

    /// Progress of the computation this lookup waits on, if any
    pub fn progress(&self) -> Option<watch::Receiver<Progress>> {
        match &self.state {
            PendingState::Ready(_) => None,
            PendingState::Waiting { progress, .. } => Some(progress.clone()),
        }
    }

    /// Wait for the entry. Dropping this future only abandons this caller's wait.
    pub async fn wait(self) -> Result<Lookup<V>> {
        match self.state {
            PendingState::Ready(entry) => Ok(Lookup {
                entry,
                status: CacheStatus::Hit,
            }),
            PendingState::Waiting { outcome, status, .. } => match outcome.await {
                Ok(entry) => Ok(Lookup { entry, status }),
                Err(source) => Err(AppError::CacheCompute {
                    key: self.key,
                    source,
                }),
            },
        }
    }
}

struct Inner<V> {
    store: Cache<String, Arc<CacheEntry<V>>>,
    in_flight: DashMap<String, InFlight<V>>,
    ttl: Duration,
    next_id: AtomicU64,
    computations: AtomicU64,
}

impl<V: Clone + Cacheable + Send + Sync + 'static> Inner<V> {
    /// Publish the outcome, then release the in-flight marker
    fn finalize(&self, key: &str, id: u64, result: Result<V>) -> Outcome<V> {
        let outcome = match result {
            Ok(value) => {
                let created_at = Utc::now();
                let expires_at = created_at
                    + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::weeks(52));
                let cacheable = value.is_cacheable();
                let entry = Arc::new(CacheEntry {
                    key: key.to_string(),
                    value,
                    created_at,
                    expires_at,
                });

                if cacheable {
                    self.store.insert(key.to_string(), entry.clone());
                    debug!(key = %key, "Cache set");
                } else {
                    debug!(key = %key, "Computation result not cacheable");
                }
                Ok(entry)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached computation failed");
                Err(Arc::new(e))
            }
        };

        // Store first: a caller that misses the marker must find the entry
        self.in_flight.remove_if(key, |_, flight| flight.id == id);
        outcome
    }
}

/// Content-addressed cache with single-flight computation
pub struct SingleFlightCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for SingleFlightCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Cacheable + Send + Sync + 'static> SingleFlightCache<V> {
    /// Create a cache holding at most `max_entries` finalized entries for `ttl`
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let store = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            inner: Arc::new(Inner {
                store,
                in_flight: DashMap::new(),
                ttl,
                next_id: AtomicU64::new(1),
                computations: AtomicU64::new(0),
            }),
        }
    }

    /// Finalized entry for `key`, if present and not expired
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry<V>>> {
        self.inner.store.get(key)
    }

    /// Look up `key`, joining or starting its computation on a miss.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn begin<F, Fut>(&self, key: &str, compute: F) -> Pending<V>
    where
        F: FnOnce(ProgressSink) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(entry) = self.inner.store.get(key) {
            debug!(key = %key, "Cache hit");
            return ready(key, entry);
        }

        match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                debug!(key = %key, "Joining in-flight computation");
                let flight = occupied.get();
                Pending {
                    key: key.to_string(),
                    state: PendingState::Waiting {
                        outcome: flight.outcome.clone(),
                        progress: flight.progress.clone(),
                        status: CacheStatus::Coalesced,
                    },
                }
            }
            Entry::Vacant(vacant) => {
                // A computation may have finalized between the first lookup and the marker lock
                if let Some(entry) = self.inner.store.get(key) {
                    debug!(key = %key, "Cache hit");
                    return ready(key, entry);
                }

                debug!(key = %key, "Cache miss, starting computation");
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                self.inner.computations.fetch_add(1, Ordering::Relaxed);

                let (tx, rx) = watch::channel(Progress::default());
                let work = compute(ProgressSink::new(tx));

                let inner = self.inner.clone();
                let task_key = key.to_string();
                let task = tokio::spawn(async move {
                    let result = match AssertUnwindSafe(work).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(AppError::Internal {
                            message: "cached computation panicked".to_string(),
                        }),
                    };
                    inner.finalize(&task_key, id, result)
                });

                let inner = self.inner.clone();
                let join_key = key.to_string();
                let outcome = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            inner.in_flight.remove_if(&join_key, |_, flight| flight.id == id);
                            Err(Arc::new(AppError::Internal {
                                message: format!("cached computation aborted: {}", e),
                            }))
                        }
                    }
                }
                .boxed()
                .shared();

                vacant.insert(InFlight {
                    id,
                    outcome: outcome.clone(),
                    progress: rx.clone(),
                });

                Pending {
                    key: key.to_string(),
                    state: PendingState::Waiting {
                        outcome,
                        progress: rx,
                        status: CacheStatus::Miss,
                    },
                }
            }
        }
    }

    /// Return the cached entry for `key` or compute it exactly once across concurrent callers
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<Lookup<V>>
    where
        F: FnOnce(ProgressSink) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.begin(key, compute).wait().await
    }

    /// Drop a finalized entry. In-flight computations are unaffected.
    pub fn invalidate(&self, key: &str) {
        self.inner.store.invalidate(key);
    }

    /// Drop all finalized entries
    pub fn clear(&self) {
        self.inner.store.invalidate_all();
    }

    /// Number of finalized entries (after pending evictions are applied)
    pub fn len(&self) -> u64 {
        self.inner.store.run_pending_tasks();
        self.inner.store.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computations currently running
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Computations started since creation
    pub fn computations_started(&self) -> u64 {
        self.inner.computations.load(Ordering::Relaxed)
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }
}

fn ready<V>(key: &str, entry: Arc<CacheEntry<V>>) -> Pending<V> {
    Pending {
        key: key.to_string(),
        state: PendingState::Ready(entry),
    }
}

/// Cache key builder helpers
pub mod keys {
    use sha2::{Digest, Sha256};

    /// Lowercase, collapse whitespace and drop trailing sentence punctuation
    pub fn normalize_query(text: &str) -> String {
        let collapsed = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        collapsed
            .trim_end_matches(|c: char| matches!(c, '?' | '!' | '.' | ',' | ';' | ':'))
            .trim_end()
            .to_string()
    }

    /// Stable hex digest over ordered parts
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Build an answer cache key
    pub fn answer(normalized_query: &str, routing_params: &str, scope: Option<&str>) -> String {
        let digest = match scope {
            Some(session) => fingerprint(&[normalized_query, routing_params, session]),
            None => fingerprint(&[normalized_query, routing_params]),
        };
        format!("answer:{}", digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct Answer {
        text: String,
        cacheable: bool,
    }

    impl Answer {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                cacheable: true,
            }
        }
    }

    impl Cacheable for Answer {
        fn is_cacheable(&self) -> bool {
            self.cacheable
        }
    }

    fn cache() -> SingleFlightCache<Answer> {
        SingleFlightCache::new(100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_second_lookup_is_a_hit() {
        let cache = cache();

        let first = cache
            .get_or_compute("k", |_| async { Ok(Answer::new("murder")) })
            .await
            .unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        assert!(!first.from_cache());

        let second = cache
            .get_or_compute("k", |_| async { Ok(Answer::new("different")) })
            .await
            .unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.entry.value.text, "murder");
        assert!(second.entry.expires_at > second.entry.created_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute("same-key", move |_| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Answer::new("shared"))
                        })
                        .await
                })
            })
            .collect();

        let mut misses = 0;
        for handle in handles {
            let lookup = handle.await.unwrap().unwrap();
            assert_eq!(lookup.entry.value.text, "shared");
            if lookup.status == CacheStatus::Miss {
                misses += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(misses, 1);
        assert_eq!(cache.computations_started(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let first = cache.begin("k", move |_| async move {
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<Answer, _>(AppError::GenerationExhausted {
                attempts: 1,
                last_error: "down".into(),
            })
        });
        let second = cache.begin("k", |_| async { Ok(Answer::new("unused")) });
        assert_eq!(second.status(), CacheStatus::Coalesced);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        for result in [a, b] {
            match result {
                Err(AppError::CacheCompute { source, .. }) => {
                    assert!(matches!(*source, AppError::GenerationExhausted { .. }));
                }
                other => panic!("expected shared failure, got {:?}", other.map(|l| l.status)),
            }
        }

        assert_eq!(cache.in_flight(), 0);
        assert!(cache.get("k").is_none());

        // Next caller retries
        let counted = calls.clone();
        let retry = cache
            .get_or_compute("k", move |_| async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Answer::new("recovered"))
            })
            .await
            .unwrap();
        assert_eq!(retry.status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_wait_still_finalizes() {
        let cache = cache();

        let pending = cache.begin("k", |_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(Answer::new("finished anyway"))
        });
        drop(pending);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let entry = cache.get("k").expect("computation should have been cached");
        assert_eq!(entry.value.text, "finished anyway");
    }

    #[tokio::test]
    async fn test_non_cacheable_values_are_shared_only() {
        let cache = cache();
        let degraded = Answer {
            text: "no documents".into(),
            cacheable: false,
        };

        let value = degraded.clone();
        let first = cache
            .get_or_compute("k", move |_| async move { Ok(value) })
            .await
            .unwrap();
        assert_eq!(first.entry.value, degraded);
        assert!(cache.get("k").is_none());

        let second = cache
            .get_or_compute("k", |_| async { Ok(Answer::new("full")) })
            .await
            .unwrap();
        assert_eq!(second.status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = SingleFlightCache::new(10, Duration::from_millis(50));
        cache
            .get_or_compute("k", |_| async { Ok(Answer::new("stale soon")) })
            .await
            .unwrap();
        assert!(cache.get("k").is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test]
    async fn test_capacity_bounds_entries() {
        let cache = SingleFlightCache::new(2, Duration::from_secs(60));
        for key in ["a", "b", "c", "d"] {
            cache
                .get_or_compute(key, |_| async { Ok(Answer::new("v")) })
                .await
                .unwrap();
        }
        assert!(cache.len() <= 2);
    }

    #[tokio::test]
    async fn test_waiters_observe_progress() {
        let cache = cache();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let pending = cache.begin("k", move |sink| async move {
            sink.push("Section 302 ");
            sink.push("prescribes");
            let _ = release_rx.await;
            Ok(Answer::new("Section 302 prescribes"))
        });

        let mut progress = pending.progress().unwrap();
        let seen = progress
            .wait_for(|p| p.text == "Section 302 prescribes")
            .await
            .unwrap()
            .clone();
        assert_eq!(seen.attempt, 0);

        release_tx.send(()).unwrap();
        let lookup = pending.wait().await.unwrap();
        assert_eq!(lookup.entry.value.text, "Section 302 prescribes");
    }

    #[test]
    fn test_progress_restart_bumps_attempt() {
        let sink = ProgressSink::detached();
        let rx = sink.subscribe();
        sink.push("partial");
        sink.restart();
        sink.push("fresh");
        let progress = rx.borrow().clone();
        assert_eq!(progress.attempt, 1);
        assert_eq!(progress.text, "fresh");
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(
            keys::normalize_query("  What is   IPC Section 302?? "),
            "what is ipc section 302"
        );
        let a = keys::answer("what is ipc section 302", "legal|302", None);
        let b = keys::answer("what is ipc section 302", "legal|302", None);
        let scoped = keys::answer("what is ipc section 302", "legal|302", Some("session-1"));
        assert_eq!(a, b);
        assert_ne!(a, scoped);
        assert!(a.starts_with("answer:"));
        assert_ne!(keys::fingerprint(&["ab", "c"]), keys::fingerprint(&["a", "bc"]));
    }
}
