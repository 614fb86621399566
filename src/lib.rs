//! ORM Cache - multi-tier caching for an entity persistence layer
//!
//! Sits between an application and its data store and serves entity lists,
//! single objects and query results from memory, with time-based expiry,
//! bounded capacity and table-level invalidation.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod tasks;

pub use cache::{
    within_request, CacheRegistry, CacheStats, EntityListCache, ObjectSource, QueryCacheMode,
    QueryResultCache, SingleObjectCache,
};
pub use config::Config;
pub use error::{CacheError, Result};
pub use models::{Entity, QueryValue, ResultSet, ValueKind};
