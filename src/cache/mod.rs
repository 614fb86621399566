//! Cache Module
//!
//! The three cache tiers of the persistence layer and the registry that
//! owns them:
//! - [`EntityListCache`]: the full list of one entity type, refreshed as a
//!   whole when its time-to-live lapses
//! - [`SingleObjectCache`]: individually fetched objects, bounded by a
//!   maximum entry count with write-back of dirty entities
//! - [`QueryResultCache`]: results of arbitrary queries, invalidated by the
//!   tables they read

mod list;
mod object;
mod order;
mod query;
mod record;
mod registry;
mod stats;

#[cfg(test)]
mod property_tests;

pub use list::{BoxFetch, EntityListCache};
pub use object::{ObjectSource, SingleObjectCache};
pub use order::InsertionOrder;
pub use query::{within_request, QueryCacheMode, QueryResultCache};
pub use record::{expiry_after, CacheRecord, ANY_TABLE};
pub use registry::CacheRegistry;
pub use stats::{CacheStats, StatsRecorder};
