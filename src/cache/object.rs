//! Single Object Cache
//!
//! Tier 2: caches individual entities by key. Capacity is bounded and the
//! earliest inserted slot is evicted first (reads never reorder slots).
//! With auto-persist enabled, entities are written back through the
//! [`ObjectSource`] when they are evicted or swept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{CacheRecord, CacheStats, InsertionOrder, StatsRecorder};
use crate::config::{ObjectCacheConfig, SweepPolicy};
use crate::error::{CacheError, Result};
use crate::models::Entity;
use crate::tasks::MaintenanceScheduler;

// == Object Source ==
/// Backing store for a single-object cache.
#[async_trait]
pub trait ObjectSource<E: Entity>: Send + Sync + 'static {
    /// Loads the entity for `key`, `None` if it does not exist.
    async fn fetch(&self, key: &E::Key) -> anyhow::Result<Option<E>>;

    /// Writes the entity back. Best-effort: failures are logged by the
    /// cache and never reach its callers.
    async fn persist(&self, entity: &E) -> anyhow::Result<()>;
}

// == Slot ==
/// A cache slot. An unloaded slot keeps its key and position but has no
/// payload; reading it behaves like reading an expired slot.
#[derive(Debug, Clone)]
enum Slot<E> {
    Loaded(CacheRecord<Option<E>>),
    Unloaded,
}

/// What a locked re-check found for a key.
enum Lookup<E> {
    Fresh(Option<E>),
    Stale(Option<E>),
    Absent,
}

struct ObjectState<E: Entity> {
    slots: HashMap<E::Key, Slot<E>>,
    order: InsertionOrder<E::Key>,
}

struct ObjectInner<E: Entity> {
    name: String,
    config: ObjectCacheConfig,
    source: Arc<dyn ObjectSource<E>>,
    state: RwLock<ObjectState<E>>,
    /// Serialises fetch, insertion, eviction and sweeps
    insert_lock: Mutex<()>,
    disposed: AtomicBool,
    stats: StatsRecorder,
}

// == Single Object Cache ==
/// Bounded per-key entity cache with flush-on-evict.
pub struct SingleObjectCache<E: Entity> {
    inner: Arc<ObjectInner<E>>,
    scheduler: MaintenanceScheduler,
}

impl<E: Entity> SingleObjectCache<E> {
    // == Constructor ==
    /// Creates an empty cache over `source`. Call
    /// [`start_maintenance`](Self::start_maintenance) to enable the sweep.
    pub fn new(
        name: impl Into<String>,
        config: ObjectCacheConfig,
        source: Arc<dyn ObjectSource<E>>,
    ) -> Self {
        let name = name.into();
        let config = ObjectCacheConfig {
            max_entries: config.max_entries.max(1),
            ..config
        };
        Self {
            scheduler: MaintenanceScheduler::new(format!("{}-sweep", name)),
            inner: Arc::new(ObjectInner {
                name,
                config,
                source,
                state: RwLock::new(ObjectState {
                    slots: HashMap::new(),
                    order: InsertionOrder::new(),
                }),
                insert_lock: Mutex::new(()),
                disposed: AtomicBool::new(false),
                stats: StatsRecorder::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // == Get ==
    /// Returns the entity for `key`, fetching it on a miss or after expiry.
    ///
    /// Fetch errors are returned to the caller and nothing is cached. A
    /// `None` result is only cached when `allow_null` is set.
    pub async fn get(&self, key: &E::Key) -> Result<Option<E>> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return Ok(None);
        }

        // Unexpired slots are served under the read lock only
        {
            let state = inner.state.read().await;
            if let Some(Slot::Loaded(record)) = state.slots.get(key) {
                if !record.is_expired() {
                    inner.stats.record_hit();
                    return Ok(record.value.clone());
                }
            }
        }

        let _guard = inner.insert_lock.lock().await;

        let lookup = {
            let state = inner.state.read().await;
            match state.slots.get(key) {
                None => Lookup::Absent,
                Some(Slot::Unloaded) => Lookup::Stale(None),
                Some(Slot::Loaded(record)) if record.is_expired() => {
                    Lookup::Stale(record.value.clone())
                }
                Some(Slot::Loaded(record)) => Lookup::Fresh(record.value.clone()),
            }
        };

        match lookup {
            Lookup::Fresh(value) => {
                inner.stats.record_hit();
                Ok(value)
            }
            Lookup::Stale(previous) => {
                inner.stats.record_miss();
                inner.reload(key, previous).await
            }
            Lookup::Absent => {
                inner.stats.record_miss();
                inner.load_new(key).await
            }
        }
    }

    // == Put ==
    /// Stores `entity` from a write path, replacing any cached copy.
    ///
    /// An existing slot keeps its position; a new key may evict the
    /// earliest inserted slot.
    pub async fn put(&self, entity: E) {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }
        let _guard = inner.insert_lock.lock().await;
        let key = entity.key();

        let exists = inner.state.read().await.slots.contains_key(&key);
        if !exists {
            inner.make_room().await;
        }

        let mut state = inner.state.write().await;
        let record = CacheRecord::new(Some(entity), Some(inner.config.ttl));
        if state.slots.insert(key.clone(), Slot::Loaded(record)).is_none() {
            state.order.push(key);
        }
    }

    // == Remove ==
    /// Drops the slot for `key` without persisting it.
    pub async fn remove(&self, key: &E::Key) -> bool {
        let _guard = self.inner.insert_lock.lock().await;
        let mut state = self.inner.state.write().await;
        let removed = state.slots.remove(key).is_some();
        if removed {
            state.order.remove(key);
        }
        removed
    }

    // == Clear ==
    /// Drops every slot without persisting.
    pub async fn clear(&self) {
        let _guard = self.inner.insert_lock.lock().await;
        let mut state = self.inner.state.write().await;
        state.slots.clear();
        state.order.clear();
        debug!(cache = %self.inner.name, "object cache cleared");
    }

    // == Sweep ==
    /// Runs one maintenance pass; see [`SweepPolicy`].
    ///
    /// # Returns
    /// The number of slots unloaded.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Starts the periodic sweep. Idempotent.
    pub fn start_maintenance(&self) -> bool {
        let weak = Arc::downgrade(&self.inner);
        self.scheduler
            .start(self.inner.config.sweep_interval, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) if !inner.disposed.load(Ordering::Acquire) => {
                            inner.sweep().await;
                            true
                        }
                        _ => false,
                    }
                }
            })
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // == Accessors ==
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.read().await.slots.is_empty()
    }

    /// Returns true if a slot exists for `key`, loaded or not.
    pub async fn contains(&self, key: &E::Key) -> bool {
        self.inner.state.read().await.slots.contains_key(key)
    }

    /// Returns true if the slot for `key` currently holds a payload.
    pub async fn is_loaded(&self, key: &E::Key) -> bool {
        matches!(
            self.inner.state.read().await.slots.get(key),
            Some(Slot::Loaded(_))
        )
    }

    /// Keys from earliest to latest insertion.
    pub async fn keys(&self) -> Vec<E::Key> {
        self.inner.state.read().await.order.iter().cloned().collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let len = self.len().await;
        self.inner.stats.snapshot(len)
    }

    // == Shutdown ==
    /// Stops the sweep, persists dirty entities (auto-persist only) and
    /// empties the cache. Later reads return `None`.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _guard = inner.insert_lock.lock().await;
        let dirty: Vec<E> = if !inner.config.auto_persist {
            Vec::new()
        } else {
            let state = inner.state.read().await;
            state
                .slots
                .values()
                .filter_map(|slot| match slot {
                    Slot::Loaded(record) => record.value.clone(),
                    Slot::Unloaded => None,
                })
                .filter(|entity| entity.is_dirty())
                .collect()
        };
        for entity in &dirty {
            inner.flush(entity).await;
        }

        let mut state = inner.state.write().await;
        state.slots.clear();
        state.order.clear();
        info!(cache = %inner.name, flushed = dirty.len(), "object cache disposed");
    }
}

impl<E: Entity> SingleObjectCache<E> {
    /// Marks the cache disposed and stops its sweep without flushing.
    pub(crate) fn mark_disposed(&self) {
        self.scheduler.stop();
        self.inner.disposed.store(true, Ordering::Release);
    }
}

impl<E: Entity> ObjectInner<E> {
    async fn fetch(&self, key: &E::Key) -> Result<Option<E>> {
        self.stats.record_refresh();
        let timeout = self.config.fetch_timeout;
        match tokio::time::timeout(timeout, self.source.fetch(key)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Fetch(e)),
            Err(_) => Err(CacheError::FetchTimeout {
                cache: self.name.clone(),
                timeout,
            }),
        }
    }

    /// Persists one entity; failures are logged and counted.
    async fn flush(&self, entity: &E) {
        self.stats.record_flush();
        let outcome = tokio::time::timeout(self.config.fetch_timeout, self.source.persist(entity)).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "persist timed out".to_string(),
        };
        self.stats.record_persist_failure();
        warn!(
            cache = %self.name,
            key = ?entity.key(),
            error = %failure,
            "persist failed, dropping in-memory copy"
        );
    }

    /// Fills a key that had no slot. Caller holds the insert lock.
    async fn load_new(&self, key: &E::Key) -> Result<Option<E>> {
        let value = self.fetch(key).await?;
        if value.is_none() && !self.config.allow_null {
            debug!(cache = %self.name, ?key, "not found, not caching miss");
            return Ok(None);
        }

        self.make_room().await;

        let mut state = self.state.write().await;
        let record = CacheRecord::new(value.clone(), Some(self.config.ttl));
        state.slots.insert(key.clone(), Slot::Loaded(record));
        state.order.push(key.clone());
        Ok(value)
    }

    /// Refreshes an expired or unloaded slot in place. Caller holds the
    /// insert lock.
    async fn reload(&self, key: &E::Key, previous: Option<E>) -> Result<Option<E>> {
        if self.config.auto_persist {
            if let Some(entity) = previous.as_ref().filter(|e| e.is_dirty()) {
                self.flush(entity).await;
            }
        }

        let value = self.fetch(key).await?;
        let mut state = self.state.write().await;

        if value.is_none() && !self.config.allow_null {
            state.slots.remove(key);
            state.order.remove(key);
            debug!(cache = %self.name, ?key, "entity gone, slot dropped");
            return Ok(None);
        }

        let ttl = Some(self.config.ttl);
        match state.slots.get_mut(key) {
            Some(Slot::Loaded(record)) => record.refresh(value.clone(), ttl),
            Some(slot) => *slot = Slot::Loaded(CacheRecord::new(value.clone(), ttl)),
            None => {
                state
                    .slots
                    .insert(key.clone(), Slot::Loaded(CacheRecord::new(value.clone(), ttl)));
                state.order.push(key.clone());
            }
        }
        Ok(value)
    }

    /// Evicts earliest inserted slots until one more fits. Caller holds the
    /// insert lock.
    async fn make_room(&self) {
        loop {
            let victim = {
                let state = self.state.read().await;
                if state.slots.len() < self.config.max_entries {
                    return;
                }
                match state.order.peek_oldest() {
                    Some(key) => {
                        let entity = match state.slots.get(key) {
                            Some(Slot::Loaded(record)) => record.value.clone(),
                            _ => None,
                        };
                        (key.clone(), entity)
                    }
                    None => return,
                }
            };

            let (key, entity) = victim;
            if self.config.auto_persist {
                if let Some(entity) = entity.as_ref() {
                    self.flush(entity).await;
                }
            }

            let mut state = self.state.write().await;
            // The insert lock keeps `key` at the front while it is flushed
            if let Some(evicted) = state.order.evict_oldest() {
                state.slots.remove(&evicted);
            }
            self.stats.record_eviction();
            debug!(cache = %self.name, ?key, "evicted earliest inserted slot");
        }
    }

    async fn sweep(&self) -> usize {
        let _guard = self.insert_lock.lock().await;
        let now = Utc::now();
        let policy = self.config.sweep_policy;

        let candidates: Vec<(E::Key, Option<E>)> = {
            let state = self.state.read().await;
            state
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Loaded(record) => {
                        let selected = match policy {
                            SweepPolicy::FlushExpired => record.is_expired_at(now),
                            SweepPolicy::FlushAlways => true,
                        };
                        selected.then(|| (key.clone(), record.value.clone()))
                    }
                    Slot::Unloaded => None,
                })
                .collect()
        };

        let mut flushed = 0usize;
        for (key, value) in &candidates {
            if self.config.auto_persist {
                if let Some(entity) = value.as_ref().filter(|e| e.is_dirty()) {
                    self.flush(entity).await;
                    flushed += 1;
                }
            }
            if let Some(slot) = self.state.write().await.slots.get_mut(key) {
                *slot = Slot::Unloaded;
            }
        }

        let unloaded = candidates.len();
        if unloaded > 0 {
            info!(cache = %self.name, unloaded, flushed, "object cache sweep");
        } else {
            debug!(cache = %self.name, "object cache sweep: nothing to unload");
        }
        unloaded
    }
}
