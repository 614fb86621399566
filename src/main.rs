//! ORM Cache - workload driver
//!
//! Runs a short synthetic workload against all three cache tiers over an
//! in-memory product store and prints the resulting statistics as JSON.
//! Settings come from the same environment variables the library reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orm_cache::{within_request, CacheRegistry, Config, Entity, ObjectSource, ResultSet};

const PRODUCT_TABLE: &str = "Products";
const PRODUCT_COUNT: u32 = 20;
const ROUNDS: u32 = 5;

// == Demo Store ==
#[derive(Debug, Clone)]
struct Product {
    id: u32,
    name: String,
    price_cents: i64,
    dirty: bool,
}

impl Entity for Product {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Stands in for the data store behind the caches.
#[derive(Default)]
struct ProductStore {
    rows: RwLock<HashMap<u32, Product>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl ProductStore {
    fn seeded(count: u32) -> Self {
        let rows = (1..=count)
            .map(|id| {
                let product = Product {
                    id,
                    name: format!("product-{id}"),
                    price_cents: i64::from(id) * 250,
                    dirty: false,
                };
                (id, product)
            })
            .collect();
        Self {
            rows: RwLock::new(rows),
            ..Self::default()
        }
    }

    async fn all(&self) -> anyhow::Result<Vec<Product>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let rows = self.rows.read().await;
        let mut products: Vec<Product> = rows.values().cloned().collect();
        products.sort_by_key(|p| p.id);
        Ok(products)
    }

    async fn count(&self) -> i64 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.rows.read().await.len() as i64
    }

    async fn save(&self, product: Product) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut clean = product;
        clean.dirty = false;
        self.rows.write().await.insert(clean.id, clean);
    }
}

#[async_trait]
impl ObjectSource<Product> for ProductStore {
    async fn fetch(&self, key: &u32) -> anyhow::Result<Option<Product>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn persist(&self, entity: &Product) -> anyhow::Result<()> {
        self.save(entity.clone()).await;
        Ok(())
    }
}

/// Entry point for the workload driver.
///
/// # Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the cache registry over an in-memory store
/// 4. Run list, object and query rounds
/// 5. Print statistics and shut the registry down
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orm_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        list_ttl_secs = config.list.ttl.as_secs(),
        object_max_entries = config.object.max_entries,
        query_mode = ?config.query.mode,
        "Configuration loaded"
    );

    let store = Arc::new(ProductStore::seeded(PRODUCT_COUNT));
    let registry = CacheRegistry::new(config);

    let products = registry.list_cache::<Product>();
    let objects = registry.object_cache::<Product>(store.clone());
    let queries = registry.query_cache();

    for round in 0..ROUNDS {
        // Tier 1: the whole product list
        let list_store = store.clone();
        let all = products
            .get(move || {
                let store = list_store.clone();
                async move { store.all().await }
            })
            .await?;
        debug!(round, products = all.len(), "list served");

        // Tier 2: a rotating window of single products
        for id in (round..round + PRODUCT_COUNT / 2).map(|i| i % PRODUCT_COUNT + 1) {
            if let Some(mut product) = objects.get(&id).await? {
                if id % 7 == 0 {
                    product.price_cents += 1;
                    product.dirty = true;
                    objects.put(product).await;
                }
            }
        }

        // Tier 3: the same queries twice inside one unit of work
        let query_store = store.clone();
        let queries = queries.clone();
        within_request(async move {
            for _ in 0..2 {
                let sql = "SELECT COUNT(*) FROM Products";
                if queries.try_get_scalar(sql).await.is_none() {
                    let count = query_store.count().await;
                    queries.put_scalar(sql, count, [PRODUCT_TABLE]).await;
                }

                let sql = "SELECT Id, Name FROM Products WHERE PriceCents > 2000";
                if queries.try_get_table(sql).await.is_none() {
                    let rows = query_store.all().await.unwrap_or_default();
                    let result = ResultSet {
                        columns: vec!["Id".into(), "Name".into()],
                        rows: rows
                            .into_iter()
                            .filter(|p| p.price_cents > 2000)
                            .map(|p| vec![json!(p.id), json!(p.name)])
                            .collect(),
                    };
                    queries.put_table(sql, result, [PRODUCT_TABLE]).await;
                }
            }
        })
        .await;
    }

    // A write through the persistence layer keeps every tier coherent
    let added = Product {
        id: PRODUCT_COUNT + 1,
        name: "late-arrival".into(),
        price_cents: 9_900,
        dirty: false,
    };
    store.save(added.clone()).await;
    registry.entity_saved(added, &[PRODUCT_TABLE]).await;

    let report = json!({
        "list": products.stats().await,
        "object": objects.stats().await,
        "query": queries.stats().await,
        "store": {
            "reads": store.reads.load(Ordering::Relaxed),
            "writes": store.writes.load(Ordering::Relaxed),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    registry.shutdown().await;
    info!("Workload complete");
    Ok(())
}
