//! Cache Record Module
//!
//! Defines the value holder shared by all three tiers: payload, creation
//! time, optional expiry and, for query results, the table dependencies.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Dependency marker meaning "invalidated by a write to any table".
pub const ANY_TABLE: &str = "*";

// == Cache Record ==
/// A cached payload with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheRecord<V> {
    /// The stored value
    pub value: V,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiration time, None = no expiration
    pub expires_at: Option<DateTime<Utc>>,
    /// Table names this value was computed from
    pub dependencies: BTreeSet<String>,
}

impl<V> CacheRecord<V> {
    // == Constructor ==
    /// Creates a new record with optional TTL and no dependencies.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `ttl` - Optional lifetime, measured from now
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| expiry_after(now, ttl)),
            dependencies: BTreeSet::new(),
        }
    }

    /// Attaches the set of tables this value depends on.
    pub fn with_dependencies<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = tables.into_iter().map(Into::into).collect();
        self
    }

    // == Is Expired ==
    /// Checks if the record has expired.
    ///
    /// A record is expired once the current time reaches its expiration
    /// time; records without an expiration never expire.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same as [`is_expired`](Self::is_expired) against a fixed instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns the remaining lifetime, or None if no expiration is set.
    ///
    /// # Returns
    /// - `Some(Duration::ZERO)` if the record has expired
    /// - `Some(remaining)` if the record has a TTL and hasn't expired
    /// - `None` if the record never expires
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at.map(|expires| {
            (expires - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    // == Depends On ==
    /// Returns true if a write to `table` must invalidate this record.
    ///
    /// An empty dependency set or the `*` marker matches every table.
    pub fn depends_on(&self, table: &str) -> bool {
        self.dependencies.is_empty()
            || self.dependencies.contains(ANY_TABLE)
            || self.dependencies.contains(table)
    }

    /// Replaces the value and restarts the TTL, keeping the dependencies.
    pub fn refresh(&mut self, value: V, ttl: Option<Duration>) {
        let now = Utc::now();
        self.value = value;
        self.created_at = now;
        self.expires_at = ttl.map(|ttl| expiry_after(now, ttl));
    }
}

// == Utility Functions ==
/// Returns `now + ttl`, saturating at the latest representable time.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_record_creation_no_ttl() {
        let record = CacheRecord::new("test_value".to_string(), None);

        assert_eq!(record.value, "test_value");
        assert!(record.expires_at.is_none());
        assert!(!record.is_expired());
        assert!(record.ttl_remaining().is_none());
    }

    #[test]
    fn test_record_expiration() {
        let record = CacheRecord::new(1u32, Some(Duration::from_millis(50)));
        assert!(!record.is_expired());

        sleep(Duration::from_millis(80));

        assert!(record.is_expired());
        assert_eq!(record.ttl_remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_ttl_remaining() {
        let record = CacheRecord::new(1u32, Some(Duration::from_secs(10)));

        let remaining = record.ttl_remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining >= Duration::from_secs(9));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = Utc::now();
        let record = CacheRecord {
            value: "test",
            created_at: now,
            expires_at: Some(now),
            dependencies: BTreeSet::new(),
        };

        assert!(record.is_expired_at(now), "Record should be expired at boundary");
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let record = CacheRecord::new((), Some(Duration::from_secs(u64::MAX)));
        assert_eq!(record.expires_at, Some(DateTime::<Utc>::MAX_UTC));
        assert!(!record.is_expired());
    }

    #[test]
    fn test_depends_on() {
        let scoped = CacheRecord::new((), None).with_dependencies(["Orders"]);
        assert!(scoped.depends_on("Orders"));
        assert!(!scoped.depends_on("Customers"));

        let unscoped = CacheRecord::new((), None);
        assert!(unscoped.depends_on("Customers"));

        let wildcard = CacheRecord::new((), None).with_dependencies([ANY_TABLE, "Orders"]);
        assert!(wildcard.depends_on("Anything"));
    }

    #[test]
    fn test_refresh_keeps_dependencies() {
        let mut record = CacheRecord::new(1, Some(Duration::from_millis(10))).with_dependencies(["T"]);
        sleep(Duration::from_millis(20));
        assert!(record.is_expired());

        record.refresh(2, Some(Duration::from_secs(60)));
        assert_eq!(record.value, 2);
        assert!(!record.is_expired());
        assert!(record.dependencies.contains("T"));
    }
}
