//! Entity List Cache
//!
//! Tier 1: caches the full result list of one entity type. A cold cache is
//! filled synchronously; a warm, expired cache is refreshed in the
//! background while readers keep receiving the previous list.
//!
//! At most one fetch runs per cache instance at a time. Readers that see a
//! stale list take the refresh lock and re-check before fetching, so
//! concurrent readers coalesce onto a single fetch.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::record::expiry_after;
use crate::cache::{CacheStats, StatsRecorder};
use crate::config::ListCacheConfig;
use crate::error::{CacheError, Result};
use crate::models::Entity;

/// Boxed future returned by a stored fetch callback.
pub type BoxFetch<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

type ListFetch<E> = Arc<dyn Fn() -> BoxFetch<Vec<E>> + Send + Sync>;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Ids of the list caches whose fetch is running on the current task.
    static REFRESHING: HashSet<u64>;
}

fn is_refreshing(cache_id: u64) -> bool {
    REFRESHING
        .try_with(|ids| ids.contains(&cache_id))
        .unwrap_or(false)
}

/// Runs `fut` with `cache_id` added to the task's refresh token set.
async fn with_refresh_token<F: Future>(cache_id: u64, fut: F) -> F::Output {
    let mut ids = REFRESHING.try_with(|ids| ids.clone()).unwrap_or_default();
    ids.insert(cache_id);
    REFRESHING.scope(ids, fut).await
}

// == List State ==
struct ListState<E> {
    /// Current snapshot, never partially filled
    entries: Arc<Vec<E>>,
    expires_at: DateTime<Utc>,
    refresh_count: u64,
    /// Bumped by every write-path change to `entries`
    writes: u64,
    /// Last fetch callback, reused when an invalidation triggers a refresh
    fetcher: Option<ListFetch<E>>,
}

impl<E> ListState<E> {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.entries.is_empty() || now >= self.expires_at
    }

    fn is_warm(&self) -> bool {
        self.refresh_count > 0 && !self.entries.is_empty()
    }
}

struct ListInner<E> {
    id: u64,
    name: String,
    config: ListCacheConfig,
    state: RwLock<ListState<E>>,
    /// Held for the whole decision + synchronous fetch
    refresh_lock: Mutex<()>,
    /// A background refresh has been dispatched and not yet finished
    refresh_in_flight: AtomicBool,
    /// Set once any reader has received the list
    in_use: AtomicBool,
    disposed: AtomicBool,
    stats: StatsRecorder,
}

// == Entity List Cache ==
/// Per-entity-type cache of a complete result list.
pub struct EntityListCache<E: Entity> {
    inner: Arc<ListInner<E>>,
}

impl<E: Entity> EntityListCache<E> {
    // == Constructor ==
    /// Creates an empty cache; the first `get` fills it.
    pub fn new(name: impl Into<String>, config: ListCacheConfig) -> Self {
        Self {
            inner: Arc::new(ListInner {
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                config,
                state: RwLock::new(ListState {
                    entries: Arc::new(Vec::new()),
                    expires_at: DateTime::<Utc>::MIN_UTC,
                    refresh_count: 0,
                    writes: 0,
                    fetcher: None,
                }),
                refresh_lock: Mutex::new(()),
                refresh_in_flight: AtomicBool::new(false),
                in_use: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                stats: StatsRecorder::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // == Get ==
    /// Returns the cached list, fetching it when empty or expired.
    ///
    /// - Cold cache, or async refresh disabled: `fetch` runs on this call and
    ///   its error, if any, is returned.
    /// - Warm cache with async refresh: the previous list is returned at once
    ///   and `fetch` runs in the background.
    /// - Called from inside this cache's own fetch: the current list is
    ///   returned as-is, possibly empty.
    ///
    /// The returned snapshot is immutable; later updates build a new one.
    pub async fn get<F, Fut>(&self, fetch: F) -> Result<Arc<Vec<E>>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<E>>> + Send + 'static,
    {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Ok(Arc::new(Vec::new()));
        }

        // Fast path: fresh list
        {
            let state = inner.state.read().await;
            if !state.needs_refresh(Utc::now()) {
                let entries = state.entries.clone();
                drop(state);
                return Ok(self.serve(entries, true));
            }
        }

        if is_refreshing(inner.id) {
            debug!(cache = %inner.name, "reentrant get during refresh, serving current list");
            return Ok(self.snapshot().await);
        }

        let fetcher: ListFetch<E> = Arc::new(move || Box::pin(fetch()) as BoxFetch<Vec<E>>);

        let _guard = inner.refresh_lock.lock().await;

        // Re-check: another caller may have refreshed while we waited
        let (stale, warm) = {
            let state = inner.state.read().await;
            (state.needs_refresh(Utc::now()), state.is_warm())
        };
        if !stale {
            let entries = self.snapshot().await;
            return Ok(self.serve(entries, true));
        }

        if warm && inner.config.async_refresh {
            if inner.refresh_in_flight.load(Ordering::Acquire) {
                // Stale list while the running refresh finishes
                let entries = self.snapshot().await;
                return Ok(self.serve(entries, false));
            }
            let previous = ListInner::dispatch_refresh(inner, fetcher).await;
            return Ok(self.serve(previous, false));
        }

        let entries = ListInner::refresh_now(inner, fetcher).await?;
        Ok(self.serve(entries, false))
    }

    // == Clear ==
    /// Invalidates the list after a write.
    ///
    /// With async refresh enabled and a warm list, a background refresh is
    /// started right away using the last fetch callback. Otherwise the list
    /// is marked expired so the next reader refreshes synchronously.
    pub async fn clear(&self, reason: &str) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }
        debug!(cache = %inner.name, reason, "list cache invalidated");

        if inner.config.async_refresh && !is_refreshing(inner.id) {
            let _guard = inner.refresh_lock.lock().await;
            let fetcher = {
                let state = inner.state.read().await;
                if state.entries.is_empty() {
                    None
                } else {
                    state.fetcher.clone()
                }
            };
            if let Some(fetcher) = fetcher {
                if !inner.refresh_in_flight.load(Ordering::Acquire) {
                    ListInner::dispatch_refresh(inner, fetcher).await;
                    return;
                }
            }
        }

        inner.state.write().await.expires_at = DateTime::<Utc>::MIN_UTC;
    }

    // == Update ==
    /// Replaces the element with the same key as `entity`, or appends it.
    ///
    /// Only applies once a reader has pulled the list; an unused cache is
    /// left alone and will pick the change up on its first fetch.
    ///
    /// # Returns
    /// `true` if the cached list was changed.
    pub async fn update(&self, entity: E) -> bool {
        if !self.accepts_writes() {
            return false;
        }
        let key = entity.key();
        let mut state = self.inner.state.write().await;
        let mut entries: Vec<E> = state
            .entries
            .iter()
            .filter(|e| e.key() != key)
            .cloned()
            .collect();
        entries.push(entity);
        state.entries = Arc::new(entries);
        state.writes += 1;
        true
    }

    /// Drops the element with `key` from a list that is in use.
    ///
    /// # Returns
    /// `true` if an element was removed.
    pub async fn remove(&self, key: &E::Key) -> bool {
        if !self.accepts_writes() {
            return false;
        }
        let mut state = self.inner.state.write().await;
        if !state.entries.iter().any(|e| &e.key() == key) {
            return false;
        }
        let entries: Vec<E> = state
            .entries
            .iter()
            .filter(|e| &e.key() != key)
            .cloned()
            .collect();
        state.entries = Arc::new(entries);
        state.writes += 1;
        true
    }

    // == Accessors ==
    /// Returns the current list without checking expiry.
    pub async fn snapshot(&self) -> Arc<Vec<E>> {
        self.inner.state.read().await.entries.clone()
    }

    pub async fn refresh_count(&self) -> u64 {
        self.inner.state.read().await.refresh_count
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.inner.state.read().await.expires_at
    }

    /// Returns true once any reader has received the list.
    pub fn is_in_use(&self) -> bool {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Returns true while a background refresh is running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh_in_flight.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> CacheStats {
        let len = self.inner.state.read().await.entries.len();
        self.inner.stats.snapshot(len)
    }

    // == Shutdown ==
    /// Disposes the cache. Later reads return an empty list and writes are
    /// ignored; a background refresh still running discards its result.
    pub async fn shutdown(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let mut state = self.inner.state.write().await;
        state.entries = Arc::new(Vec::new());
        state.fetcher = None;
        debug!(cache = %self.inner.name, "list cache disposed");
    }

    /// Marks the cache disposed without touching its state.
    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    fn accepts_writes(&self) -> bool {
        !self.inner.disposed.load(Ordering::Acquire) && self.is_in_use()
    }

    /// Marks the list in use, counts the access and hands out the snapshot.
    fn serve(&self, entries: Arc<Vec<E>>, hit: bool) -> Arc<Vec<E>> {
        let inner = &self.inner;
        inner.in_use.store(true, Ordering::Release);

        let requests = if hit {
            inner.stats.record_hit()
        } else {
            inner.stats.record_miss()
        };
        let every = inner.config.stats_log_every;
        if every > 0 && requests % every == 0 {
            let stats = inner.stats.snapshot(entries.len());
            info!(
                cache = %inner.name,
                requests,
                refreshes = stats.refreshes,
                "list cache hit rate {:.1}%",
                stats.hit_rate() * 100.0
            );
        }
        entries
    }
}

impl<E: Entity> ListInner<E> {
    /// Fetches on the calling task and installs the result. The caller
    /// holds the refresh lock.
    async fn refresh_now(inner: &Arc<Self>, fetcher: ListFetch<E>) -> Result<Arc<Vec<E>>> {
        debug!(cache = %inner.name, "refreshing list synchronously");
        inner.stats.record_refresh();
        let writes_before = inner.state.read().await.writes;

        let timeout = inner.config.fetch_timeout;
        let fetched = match tokio::time::timeout(timeout, with_refresh_token(inner.id, fetcher())).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => return Err(CacheError::Fetch(e)),
            Err(_) => {
                return Err(CacheError::FetchTimeout {
                    cache: inner.name.clone(),
                    timeout,
                })
            }
        };

        let mut state = inner.state.write().await;
        state.entries = Arc::new(fetched);
        state.expires_at = expiry_after(Utc::now(), inner.config.ttl);
        state.refresh_count += 1;
        state.fetcher = Some(fetcher);
        if state.writes != writes_before {
            // A write raced the fetch; the next reader fetches again
            state.expires_at = DateTime::<Utc>::MIN_UTC;
            debug!(cache = %inner.name, "list written during refresh, marked expired");
        }
        debug!(cache = %inner.name, entries = state.entries.len(), "list refreshed");
        Ok(state.entries.clone())
    }

    /// Moves the expiry forward and starts a background fetch. The caller
    /// holds the refresh lock. Returns the list readers keep seeing until
    /// the fetch completes.
    async fn dispatch_refresh(inner: &Arc<Self>, fetcher: ListFetch<E>) -> Arc<Vec<E>> {
        let (previous, writes_at_dispatch) = {
            let mut state = inner.state.write().await;
            state.expires_at = expiry_after(Utc::now(), inner.config.ttl);
            state.refresh_count += 1;
            state.fetcher = Some(fetcher.clone());
            (state.entries.clone(), state.writes)
        };

        inner.refresh_in_flight.store(true, Ordering::Release);
        inner.stats.record_refresh();
        debug!(cache = %inner.name, "dispatching background list refresh");

        let weak = Arc::downgrade(inner);
        let id = inner.id;
        let name = inner.name.clone();
        let timeout = inner.config.fetch_timeout;

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, with_refresh_token(id, fetcher())).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            match outcome {
                Ok(Ok(entries)) => {
                    if !inner.disposed.load(Ordering::Acquire) {
                        let count = entries.len();
                        let mut state = inner.state.write().await;
                        if state.writes == writes_at_dispatch {
                            state.entries = Arc::new(entries);
                            debug!(cache = %name, entries = count, "background list refresh complete");
                        } else {
                            // The fetch predates a write; keep the written
                            // list and let the next reader refresh again
                            state.expires_at = DateTime::<Utc>::MIN_UTC;
                            debug!(cache = %name, "list written during background refresh, result discarded");
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(cache = %name, error = %format!("{e:#}"), "background list refresh failed, keeping previous list");
                }
                Err(_) => {
                    warn!(cache = %name, ?timeout, "background list refresh timed out, keeping previous list");
                }
            }
            inner.refresh_in_flight.store(false, Ordering::Release);
        });

        previous
    }
}
