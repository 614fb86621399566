//! Data Models Module
//!
//! Types exchanged between the cache tiers and the persistence layer:
//! the entity contract and the shapes of cached query results.

mod entity;
mod result_set;

pub use entity::Entity;
pub use result_set::{QueryValue, ResultSet, ValueKind};
