//! Cache Registry
//!
//! Owns every cache instance of a persistence layer: one list cache and one
//! single-object cache per entity type, plus the query result cache. The
//! registry is constructed from a [`Config`] and passed to whatever needs
//! caching; tearing it down disposes every cache it created.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cache::{EntityListCache, ObjectSource, QueryResultCache, SingleObjectCache};
use crate::config::Config;
use crate::models::Entity;

/// Type-erased teardown hook for a registered cache.
#[async_trait]
trait Disposable: Send + Sync {
    async fn dispose(&self);
}

#[async_trait]
impl<E: Entity> Disposable for EntityListCache<E> {
    async fn dispose(&self) {
        self.shutdown().await;
    }
}

#[async_trait]
impl<E: Entity> Disposable for SingleObjectCache<E> {
    async fn dispose(&self) {
        self.shutdown().await;
    }
}

struct Registered {
    cache: Arc<dyn Any + Send + Sync>,
    disposer: Arc<dyn Disposable>,
}

type TypeMap = Mutex<HashMap<TypeId, Registered>>;

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    full.rsplit("::").next().unwrap_or(full)
}

// == Cache Registry ==
/// Explicit owner of all cache tiers.
pub struct CacheRegistry {
    config: Config,
    lists: TypeMap,
    objects: TypeMap,
    query: Arc<QueryResultCache>,
    shut_down: AtomicBool,
}

impl CacheRegistry {
    pub fn new(config: Config) -> Self {
        let query = Arc::new(QueryResultCache::new(config.query.clone()));
        Self {
            config,
            lists: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            query,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // == List Cache ==
    /// Returns the list cache for entity type `E`, creating it on first use.
    pub fn list_cache<E: Entity>(&self) -> Arc<EntityListCache<E>> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registered) = lists.get(&TypeId::of::<E>()) {
            if let Ok(cache) = registered.cache.clone().downcast::<EntityListCache<E>>() {
                return cache;
            }
        }

        let cache = Arc::new(EntityListCache::<E>::new(
            short_type_name::<E>(),
            self.config.list.clone(),
        ));
        if self.shut_down.load(Ordering::Acquire) {
            cache.mark_disposed();
        }
        debug!(cache = %cache.name(), "list cache registered");
        lists.insert(
            TypeId::of::<E>(),
            Registered {
                cache: cache.clone(),
                disposer: cache.clone(),
            },
        );
        cache
    }

    // == Object Cache ==
    /// Returns the single-object cache for entity type `E`, creating it
    /// over `source` (and starting its sweep) on first use. Later calls
    /// return the existing cache and ignore `source`.
    pub fn object_cache<E: Entity>(
        &self,
        source: Arc<dyn ObjectSource<E>>,
    ) -> Arc<SingleObjectCache<E>> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registered) = objects.get(&TypeId::of::<E>()) {
            if let Ok(cache) = registered.cache.clone().downcast::<SingleObjectCache<E>>() {
                return cache;
            }
        }

        let cache = Arc::new(SingleObjectCache::<E>::new(
            short_type_name::<E>(),
            self.config.object.clone(),
            source,
        ));
        if self.shut_down.load(Ordering::Acquire) {
            cache.mark_disposed();
        } else {
            cache.start_maintenance();
        }
        debug!(cache = %cache.name(), "object cache registered");
        objects.insert(
            TypeId::of::<E>(),
            Registered {
                cache: cache.clone(),
                disposer: cache.clone(),
            },
        );
        cache
    }

    /// Returns the object cache for `E` if one was created.
    pub fn existing_object_cache<E: Entity>(&self) -> Option<Arc<SingleObjectCache<E>>> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(&TypeId::of::<E>())
            .and_then(|registered| registered.cache.clone().downcast().ok())
    }

    fn existing_list_cache<E: Entity>(&self) -> Option<Arc<EntityListCache<E>>> {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists
            .get(&TypeId::of::<E>())
            .and_then(|registered| registered.cache.clone().downcast().ok())
    }

    // == Query Cache ==
    /// Returns the query result cache, starting its sweep when the mode
    /// needs one.
    pub fn query_cache(&self) -> Arc<QueryResultCache> {
        if !self.shut_down.load(Ordering::Acquire) && !self.query.is_maintenance_running() {
            self.query.start_maintenance();
        }
        self.query.clone()
    }

    // == Write Path Hooks ==
    /// Keeps caches coherent after `entity` was inserted or updated in
    /// the store: warm list caches take the new version, a cached single
    /// object is replaced, and query results over `tables` are dropped.
    pub async fn entity_saved<E: Entity>(&self, entity: E, tables: &[&str]) {
        if let Some(list) = self.existing_list_cache::<E>() {
            list.update(entity.clone()).await;
        }
        if let Some(objects) = self.existing_object_cache::<E>() {
            objects.put(entity).await;
        }
        self.query.invalidate_all(tables).await;
    }

    /// Keeps caches coherent after the entity with `key` was deleted.
    pub async fn entity_deleted<E: Entity>(&self, key: &E::Key, tables: &[&str]) {
        if let Some(list) = self.existing_list_cache::<E>() {
            list.remove(key).await;
        }
        if let Some(objects) = self.existing_object_cache::<E>() {
            objects.remove(key).await;
        }
        self.query.invalidate_all(tables).await;
    }

    /// Drops query results that depend on any of `tables`.
    pub async fn invalidate_tables(&self, tables: &[&str]) -> usize {
        self.query.invalidate_all(tables).await
    }

    // == Shutdown ==
    /// Disposes every cache this registry created. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let disposers: Vec<Arc<dyn Disposable>> = {
            let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
            let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
            lists
                .values()
                .chain(objects.values())
                .map(|registered| registered.disposer.clone())
                .collect()
        };

        for disposer in &disposers {
            disposer.dispose().await;
        }
        self.query.shutdown().await;
        info!(caches = disposers.len() + 1, "cache registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
