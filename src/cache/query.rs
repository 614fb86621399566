//! Query Result Cache
//!
//! Tier 3: caches raw query results (result sets and scalars) by query
//! text. Entries carry the set of tables they were read from and are
//! dropped when any of those tables is written.
//!
//! The backing store depends on the mode chosen at startup:
//! - `Disabled`: nothing is cached
//! - `RequestScoped`: a store that lives for one request (see
//!   [`within_request`]); outside a request nothing is cached
//! - `Permanent`: a process-wide store, emptied only by invalidation
//! - `TimeLimited`: a process-wide store whose entries expire and are
//!   removed by the periodic sweep

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::cache::{CacheRecord, CacheStats, StatsRecorder};
use crate::config::QueryCacheConfig;
use crate::models::{QueryValue, ResultSet, ValueKind};
use crate::tasks::MaintenanceScheduler;

static NEXT_QUERY_CACHE_ID: AtomicU64 = AtomicU64::new(1);

type RequestStores = Arc<Mutex<HashMap<u64, QueryStore>>>;

tokio::task_local! {
    /// Per-request stores, keyed by query cache id.
    static REQUEST_STORES: RequestStores;
}

// == Request Scope ==
/// Runs `fut` as one request: request-scoped query caches used inside it
/// share a fresh store that is dropped when `fut` completes.
pub async fn within_request<F: Future>(fut: F) -> F::Output {
    REQUEST_STORES
        .scope(Arc::new(Mutex::new(HashMap::new())), fut)
        .await
}

fn current_request() -> Option<RequestStores> {
    REQUEST_STORES.try_with(Arc::clone).ok()
}

// == Mode ==
/// How query results are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCacheMode {
    Disabled,
    RequestScoped,
    Permanent,
    TimeLimited(Duration),
}

impl QueryCacheMode {
    /// Maps the numeric setting: -2 (or lower) disabled, -1 per request,
    /// 0 permanent, n > 0 expiring after n seconds.
    pub fn from_setting(setting: i64) -> Self {
        match setting {
            0 => QueryCacheMode::Permanent,
            -1 => QueryCacheMode::RequestScoped,
            n if n > 0 => QueryCacheMode::TimeLimited(Duration::from_secs(n as u64)),
            _ => QueryCacheMode::Disabled,
        }
    }

    /// Lifetime given to new entries, None = no expiry.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            QueryCacheMode::TimeLimited(ttl) => Some(*ttl),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, QueryCacheMode::Disabled)
    }
}

// == Query Store ==
/// Result sets and scalars, keyed identically by query text.
#[derive(Debug, Default)]
struct QueryStore {
    tables: HashMap<String, CacheRecord<QueryValue>>,
    scalars: HashMap<String, CacheRecord<QueryValue>>,
}

impl QueryStore {
    fn map(&self, kind: ValueKind) -> &HashMap<String, CacheRecord<QueryValue>> {
        match kind {
            ValueKind::Table => &self.tables,
            ValueKind::Scalar => &self.scalars,
        }
    }

    fn map_mut(&mut self, kind: ValueKind) -> &mut HashMap<String, CacheRecord<QueryValue>> {
        match kind {
            ValueKind::Table => &mut self.tables,
            ValueKind::Scalar => &mut self.scalars,
        }
    }

    fn get(&self, query: &str, kind: ValueKind, now: DateTime<Utc>) -> Option<QueryValue> {
        self.map(kind)
            .get(query)
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.value.clone())
    }

    fn insert(&mut self, query: String, record: CacheRecord<QueryValue>) {
        let kind = record.value.kind();
        self.map_mut(kind).insert(query, record);
    }

    /// Removes every record matching `predicate`; returns how many.
    fn remove_where<P>(&mut self, predicate: P) -> usize
    where
        P: Fn(&CacheRecord<QueryValue>) -> bool,
    {
        let before = self.len();
        self.tables.retain(|_, record| !predicate(record));
        self.scalars.retain(|_, record| !predicate(record));
        before - self.len()
    }

    fn len(&self) -> usize {
        self.tables.len() + self.scalars.len()
    }

    fn clear(&mut self) {
        self.tables.clear();
        self.scalars.clear();
    }
}

struct QueryInner {
    id: u64,
    config: QueryCacheConfig,
    /// Process-wide store for the permanent and time-limited modes
    shared: RwLock<QueryStore>,
    disposed: AtomicBool,
    stats: StatsRecorder,
}

impl QueryInner {
    async fn sweep(&self) -> usize {
        let now = Utc::now();
        let removed = self
            .shared
            .write()
            .await
            .remove_where(|record| record.is_expired_at(now));
        if removed > 0 {
            info!(removed, "query cache sweep: removed expired results");
        } else {
            debug!("query cache sweep: no expired results");
        }
        removed
    }
}

// == Query Result Cache ==
/// Cache of raw query results with table-dependency invalidation.
pub struct QueryResultCache {
    inner: Arc<QueryInner>,
    scheduler: MaintenanceScheduler,
}

impl QueryResultCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        Self {
            inner: Arc::new(QueryInner {
                id: NEXT_QUERY_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                config,
                shared: RwLock::new(QueryStore::default()),
                disposed: AtomicBool::new(false),
                stats: StatsRecorder::new(),
            }),
            scheduler: MaintenanceScheduler::new("query-cache-sweep"),
        }
    }

    pub fn mode(&self) -> QueryCacheMode {
        self.inner.config.mode
    }

    /// See the free function [`within_request`].
    pub async fn within_request<F: Future>(fut: F) -> F::Output {
        within_request(fut).await
    }

    // == Try Get ==
    /// Looks up a cached result of the given kind.
    pub async fn try_get(&self, query: &str, kind: ValueKind) -> Option<QueryValue> {
        if !self.is_active() {
            return None;
        }
        let now = Utc::now();
        let found = self
            .read_store(|store| store.get(query, kind, now))
            .await
            .flatten();

        if found.is_some() {
            self.inner.stats.record_hit();
        } else {
            self.inner.stats.record_miss();
        }
        found
    }

    pub async fn try_get_table(&self, query: &str) -> Option<Arc<ResultSet>> {
        match self.try_get(query, ValueKind::Table).await {
            Some(QueryValue::Table(rs)) => Some(rs),
            _ => None,
        }
    }

    pub async fn try_get_scalar(&self, query: &str) -> Option<i64> {
        self.try_get(query, ValueKind::Scalar)
            .await
            .and_then(|value| value.as_scalar())
    }

    // == Put ==
    /// Caches `value` for `query`, invalidated by writes to any of
    /// `dependencies`. An empty set or `*` means "any table".
    pub async fn put<I, S>(&self, query: impl Into<String>, value: QueryValue, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.is_active() {
            return;
        }
        let record = CacheRecord::new(value, self.mode().ttl()).with_dependencies(dependencies);
        let query = query.into();
        let stored = self
            .write_store(move |store| store.insert(query, record))
            .await;
        if stored.is_none() {
            debug!("query result not cached: no active request scope");
        }
    }

    pub async fn put_table<I, S>(&self, query: impl Into<String>, result: ResultSet, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.put(query, QueryValue::Table(Arc::new(result)), dependencies)
            .await;
    }

    pub async fn put_scalar<I, S>(&self, query: impl Into<String>, value: i64, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.put(query, QueryValue::Scalar(value), dependencies).await;
    }

    // == Invalidate ==
    /// Drops every result that depends on `table`, including results with
    /// no recorded dependencies or the `*` marker.
    ///
    /// # Returns
    /// The number of results removed.
    pub async fn invalidate(&self, table: &str) -> usize {
        self.invalidate_all(&[table]).await
    }

    /// Drops every result that depends on any of `tables`.
    pub async fn invalidate_all<S: AsRef<str>>(&self, tables: &[S]) -> usize {
        if tables.is_empty() || !self.is_active() {
            return 0;
        }
        let removed = self
            .write_store(|store| {
                store.remove_where(|record| {
                    tables.iter().any(|table| record.depends_on(table.as_ref()))
                })
            })
            .await
            .unwrap_or(0);

        self.inner.stats.record_invalidations(removed);
        debug!(
            tables = ?tables.iter().map(|t| t.as_ref()).collect::<Vec<&str>>(),
            removed,
            "query cache invalidated"
        );
        removed
    }

    // == Clear ==
    /// Drops every result in the current backing store.
    pub async fn clear(&self) {
        self.write_store(QueryStore::clear).await;
    }

    /// Number of results in the current backing store.
    pub async fn len(&self) -> usize {
        self.read_store(QueryStore::len).await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let len = self.len().await;
        self.inner.stats.snapshot(len)
    }

    // == Sweep ==
    /// Removes expired results from the process-wide store.
    ///
    /// Request-scoped stores are never swept; they end with their request.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Starts the periodic sweep. Only the time-limited mode has anything
    /// to sweep; other modes return `false`.
    pub fn start_maintenance(&self) -> bool {
        if !matches!(self.mode(), QueryCacheMode::TimeLimited(_)) {
            return false;
        }
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

    // == Shutdown ==
    /// Stops the sweep and empties the process-wide store. Later lookups
    /// miss and puts are ignored.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.shared.write().await.clear();
        debug!("query cache disposed");
    }

    fn is_active(&self) -> bool {
        self.mode().is_enabled() && !self.inner.disposed.load(Ordering::Acquire)
    }

    /// Runs `f` against the backing store for the current context, if any.
    async fn read_store<R>(&self, f: impl FnOnce(&QueryStore) -> R) -> Option<R> {
        match self.mode() {
            QueryCacheMode::Disabled => None,
            QueryCacheMode::RequestScoped => {
                let stores = current_request()?;
                let stores = stores.lock().await;
                stores.get(&self.inner.id).map(f)
            }
            QueryCacheMode::Permanent | QueryCacheMode::TimeLimited(_) => {
                Some(f(&*self.inner.shared.read().await))
            }
        }
    }

    async fn write_store<R>(&self, f: impl FnOnce(&mut QueryStore) -> R) -> Option<R> {
        match self.mode() {
            QueryCacheMode::Disabled => None,
            QueryCacheMode::RequestScoped => {
                let stores = current_request()?;
                let mut stores = stores.lock().await;
                Some(f(stores.entry(self.inner.id).or_default()))
            }
            QueryCacheMode::Permanent | QueryCacheMode::TimeLimited(_) => {
                Some(f(&mut *self.inner.shared.write().await))
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ANY_TABLE;
    use serde_json::json;

    const ORDERS_QUERY: &str = "SELECT * FROM Orders WHERE CustomerId = 7";

    fn cache(mode: QueryCacheMode) -> QueryResultCache {
        QueryResultCache::new(QueryCacheConfig::new(mode))
    }

    fn orders() -> ResultSet {
        ResultSet::new(vec!["Id".to_string()], vec![vec![json!(1)], vec![json!(2)]])
    }

    #[test]
    fn test_mode_from_setting() {
        assert_eq!(QueryCacheMode::from_setting(-2), QueryCacheMode::Disabled);
        assert_eq!(QueryCacheMode::from_setting(-9), QueryCacheMode::Disabled);
        assert_eq!(QueryCacheMode::from_setting(-1), QueryCacheMode::RequestScoped);
        assert_eq!(QueryCacheMode::from_setting(0), QueryCacheMode::Permanent);
        assert_eq!(
            QueryCacheMode::from_setting(30),
            QueryCacheMode::TimeLimited(Duration::from_secs(30))
        );
        assert_eq!(QueryCacheMode::Permanent.ttl(), None);
    }

    #[tokio::test]
    async fn test_disabled_mode_never_caches() {
        let cache = cache(QueryCacheMode::Disabled);
        cache.put_scalar("SELECT COUNT(*) FROM Orders", 5, ["Orders"]).await;

        assert!(cache.try_get_scalar("SELECT COUNT(*) FROM Orders").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_round_trip() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_table(ORDERS_QUERY, orders(), ["Orders"]).await;

        let cached = cache.try_get_table(ORDERS_QUERY).await.unwrap();
        assert_eq!(*cached, orders());
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_table_and_scalar_keys_are_separate() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_scalar(ORDERS_QUERY, 2, ["Orders"]).await;

        assert!(cache.try_get_table(ORDERS_QUERY).await.is_none());
        assert_eq!(cache.try_get_scalar(ORDERS_QUERY).await, Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_matches_dependency() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_table(ORDERS_QUERY, orders(), ["Orders"]).await;

        assert_eq!(cache.invalidate("Customers").await, 0);
        assert!(cache.try_get_table(ORDERS_QUERY).await.is_some());

        assert_eq!(cache.invalidate("Orders").await, 1);
        assert!(cache.try_get_table(ORDERS_QUERY).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_and_wildcard_dependencies_match_any_table() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_scalar("q-empty", 1, Vec::<String>::new()).await;
        cache.put_scalar("q-wild", 2, [ANY_TABLE]).await;
        cache.put_scalar("q-orders", 3, ["Orders"]).await;

        assert_eq!(cache.invalidate("Invoices").await, 2);
        assert!(cache.try_get_scalar("q-empty").await.is_none());
        assert!(cache.try_get_scalar("q-wild").await.is_none());
        assert_eq!(cache.try_get_scalar("q-orders").await, Some(3));
        assert_eq!(cache.stats().await.invalidations, 2);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_scalar("a", 1, ["Orders"]).await;
        cache.put_scalar("b", 2, ["Customers"]).await;
        cache.put_scalar("c", 3, ["Products"]).await;

        assert_eq!(cache.invalidate_all(&["Orders", "Customers"]).await, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.invalidate_all::<&str>(&[]).await, 0);
    }

    #[tokio::test]
    async fn test_time_limited_entries_expire_and_sweep() {
        let cache = cache(QueryCacheMode::TimeLimited(Duration::from_millis(30)));
        cache.put_scalar("q", 1, ["Orders"]).await;
        assert_eq!(cache.try_get_scalar("q").await, Some(1));

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cache.try_get_scalar("q").await.is_none());
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_time_limited_maintenance_removes_expired() {
        let cache = QueryResultCache::new(
            QueryCacheConfig::new(QueryCacheMode::TimeLimited(Duration::from_millis(20)))
                .with_sweep_interval(Duration::from_millis(30)),
        );
        cache.put_scalar("q", 1, ["Orders"]).await;

        assert!(cache.start_maintenance());
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.len().await, 0);
        cache.shutdown().await;
        assert!(!cache.is_maintenance_running());
    }

    #[tokio::test]
    async fn test_only_time_limited_mode_is_swept() {
        assert!(!cache(QueryCacheMode::Permanent).start_maintenance());
        assert!(!cache(QueryCacheMode::RequestScoped).start_maintenance());
        assert!(!cache(QueryCacheMode::Disabled).start_maintenance());
    }

    #[tokio::test]
    async fn test_request_scope_isolation() {
        let cache = cache(QueryCacheMode::RequestScoped);

        within_request(async {
            cache.put_scalar("SELECT 1", 1, ["T"]).await;
            assert_eq!(cache.try_get_scalar("SELECT 1").await, Some(1));
        })
        .await;

        within_request(async {
            assert!(cache.try_get_scalar("SELECT 1").await.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_request_scope_outside_request_is_noop() {
        let cache = cache(QueryCacheMode::RequestScoped);
        cache.put_scalar("SELECT 1", 1, ["T"]).await;

        assert!(cache.try_get_scalar("SELECT 1").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_request_scope_invalidation() {
        let cache = cache(QueryCacheMode::RequestScoped);
        within_request(async {
            cache.put_scalar("a", 1, ["Orders"]).await;
            cache.put_scalar("b", 2, ["Customers"]).await;
            assert_eq!(cache.invalidate("Orders").await, 1);
            assert_eq!(cache.len().await, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_request_scope_separates_cache_instances() {
        let first = cache(QueryCacheMode::RequestScoped);
        let second = cache(QueryCacheMode::RequestScoped);
        within_request(async {
            first.put_scalar("q", 1, ["T"]).await;
            assert!(second.try_get_scalar("q").await.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_shutdown_disables_cache() {
        let cache = cache(QueryCacheMode::Permanent);
        cache.put_scalar("q", 1, ["T"]).await;

        cache.shutdown().await;
        cache.put_scalar("q", 2, ["T"]).await;

        assert!(cache.try_get_scalar("q").await.is_none());
        assert_eq!(cache.len().await, 0);
    }
}
