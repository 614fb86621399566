//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the capacity, eviction and invalidation rules of
//! the cache tiers against simple models.

use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{EntityListCache, ObjectSource, QueryCacheMode, QueryResultCache, SingleObjectCache};
use crate::config::{ListCacheConfig, ObjectCacheConfig, QueryCacheConfig};
use crate::models::Entity;

// == Test Configuration ==
const TEST_TTL: Duration = Duration::from_secs(300);
const TABLES: [&str; 4] = ["Orders", "Customers", "Products", "Invoices"];

#[derive(Debug, Clone, PartialEq)]
struct Item {
    id: u8,
    label: String,
}

impl Entity for Item {
    type Key = u8;

    fn key(&self) -> u8 {
        self.id
    }
}

/// Source where every key exists.
struct EveryKey;

#[async_trait]
impl ObjectSource<Item> for EveryKey {
    async fn fetch(&self, key: &u8) -> anyhow::Result<Option<Item>> {
        Ok(Some(Item {
            id: *key,
            label: format!("item-{}", key),
        }))
    }

    async fn persist(&self, _entity: &Item) -> anyhow::Result<()> {
        Ok(())
    }
}

fn object_cache(max_entries: usize) -> SingleObjectCache<Item> {
    let config = ObjectCacheConfig::default()
        .with_max_entries(max_entries)
        .with_ttl(TEST_TTL);
    SingleObjectCache::new("items", config, Arc::new(EveryKey))
}

// == Strategies ==
fn dependency_strategy() -> impl Strategy<Value = BTreeSet<&'static str>> {
    prop::collection::btree_set(prop::sample::select(TABLES.to_vec()), 0..3)
}

fn items_strategy() -> impl Strategy<Value = Vec<Item>> {
    prop::collection::hash_set(any::<u8>(), 0..20).prop_map(|ids| {
        ids.into_iter()
            .map(|id| Item {
                id,
                label: format!("item-{}", id),
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // For any access sequence, the object cache never exceeds its bound
    // and always evicts the earliest inserted key still present.
    #[test]
    fn prop_object_cache_bounded_fifo(
        max_entries in 1usize..6,
        keys in prop::collection::vec(0u8..12, 1..60),
    ) {
        let cache = object_cache(max_entries);
        let mut model: VecDeque<u8> = VecDeque::new();

        tokio_test::block_on(async {
            for key in &keys {
                let item = cache.get(key).await.unwrap();
                prop_assert_eq!(item.map(|i| i.id), Some(*key));

                if !model.contains(key) {
                    if model.len() == max_entries {
                        model.pop_front();
                    }
                    model.push_back(*key);
                }

                prop_assert!(cache.len().await <= max_entries);
                prop_assert_eq!(cache.keys().await, model.iter().copied().collect::<Vec<_>>());
            }
            Ok(())
        })?;
    }

    // Hits plus misses always equal the number of lookups.
    #[test]
    fn prop_object_cache_counts_every_lookup(
        keys in prop::collection::vec(0u8..8, 1..40),
    ) {
        let cache = object_cache(4);

        let stats = tokio_test::block_on(async {
            for key in &keys {
                cache.get(key).await.unwrap();
            }
            cache.stats().await
        });

        prop_assert_eq!(stats.requests(), keys.len() as u64);
        prop_assert!(stats.misses >= keys.iter().collect::<HashSet<_>>().len() as u64);
    }

    // Invalidating a table removes exactly the results that read it
    // (or declared no dependencies) and leaves the rest servable.
    #[test]
    fn prop_query_invalidation_by_table(
        deps in prop::collection::vec(dependency_strategy(), 1..20),
        table in prop::sample::select(TABLES.to_vec()),
    ) {
        let cache = QueryResultCache::new(QueryCacheConfig::new(QueryCacheMode::Permanent));

        tokio_test::block_on(async {
            for (i, set) in deps.iter().enumerate() {
                cache.put_scalar(format!("q{}", i), i as i64, set.iter().copied()).await;
            }

            let expected_removed = deps
                .iter()
                .filter(|set| set.is_empty() || set.contains(table))
                .count();
            prop_assert_eq!(cache.invalidate(table).await, expected_removed);

            for (i, set) in deps.iter().enumerate() {
                let cached = cache.try_get_scalar(&format!("q{}", i)).await;
                if set.is_empty() || set.contains(table) {
                    prop_assert_eq!(cached, None);
                } else {
                    prop_assert_eq!(cached, Some(i as i64));
                }
            }
            prop_assert_eq!(cache.len().await, deps.len() - expected_removed);
            Ok(())
        })?;
    }

    // A warm list serves what was fetched, and write-path updates land in
    // the cached list without another fetch.
    #[test]
    fn prop_list_cache_reflects_writes(
        items in items_strategy(),
        changed in any::<u8>(),
    ) {
        let cache: EntityListCache<Item> =
            EntityListCache::new("items", ListCacheConfig::default().with_ttl(TEST_TTL));
        let fetched = items.clone();

        tokio_test::block_on(async {
            let served = cache
                .get(move || std::future::ready(Ok::<_, anyhow::Error>(fetched.clone())))
                .await
                .unwrap();
            prop_assert_eq!(served.as_ref(), &items);

            let replacement = Item { id: changed, label: "changed".into() };
            prop_assert!(cache.update(replacement.clone()).await);
            let snapshot = cache.snapshot().await;
            prop_assert_eq!(snapshot.iter().filter(|i| i.id == changed).count(), 1);
            prop_assert!(snapshot.contains(&replacement));
            prop_assert_eq!(
                snapshot.len(),
                items.len() + usize::from(!items.iter().any(|i| i.id == changed))
            );

            prop_assert!(cache.remove(&changed).await);
            prop_assert!(cache.snapshot().await.iter().all(|i| i.id != changed));
            prop_assert_eq!(cache.refresh_count().await, 1);
            Ok(())
        })?;
    }
}
