//! Configuration Module
//!
//! Handles loading the process-wide cache configuration from environment
//! variables. Values are read once at startup and handed to each tier.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::QueryCacheMode;
use crate::error::CacheError;

// == Defaults ==
const DEFAULT_QUERY_CACHE_MODE: i64 = -2;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_LIST_TTL_SECS: u64 = 300;
const DEFAULT_STATS_EVERY: u64 = 1000;
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_OBJECT_TTL_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

// == Sweep Policy ==
/// Selects which tier-2 slots the periodic sweep flushes and unloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepPolicy {
    /// Only slots whose TTL has elapsed
    #[default]
    FlushExpired,
    /// Every loaded slot on every sweep, regardless of expiry
    FlushAlways,
}

impl FromStr for SweepPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expired" => Ok(SweepPolicy::FlushExpired),
            "always" => Ok(SweepPolicy::FlushAlways),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown sweep policy '{}', expected 'expired' or 'always'",
                other
            ))),
        }
    }
}

// == Tier Configs ==
/// Settings for one entity list cache (tier 1).
#[derive(Debug, Clone)]
pub struct ListCacheConfig {
    /// Lifetime of a fetched list
    pub ttl: Duration,
    /// Refresh warm caches in the background instead of blocking readers
    pub async_refresh: bool,
    /// Emit a hit-rate log line every N accesses (0 disables it)
    pub stats_log_every: u64,
    /// Upper bound on a single fetch
    pub fetch_timeout: Duration,
}

impl Default for ListCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_LIST_TTL_SECS),
            async_refresh: true,
            stats_log_every: DEFAULT_STATS_EVERY,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl ListCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_async_refresh(mut self, enabled: bool) -> Self {
        self.async_refresh = enabled;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Settings for one single-object cache (tier 2).
#[derive(Debug, Clone)]
pub struct ObjectCacheConfig {
    /// Maximum number of slots; the earliest inserted is evicted beyond it
    pub max_entries: usize,
    /// Lifetime of a fetched entity
    pub ttl: Duration,
    /// Persist entities on eviction and during sweeps
    pub auto_persist: bool,
    /// Cache "not found" results
    pub allow_null: bool,
    /// Which slots the sweep flushes
    pub sweep_policy: SweepPolicy,
    /// Period of the background sweep
    pub sweep_interval: Duration,
    /// Upper bound on a single fetch
    pub fetch_timeout: Duration,
}

impl Default for ObjectCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Duration::from_secs(DEFAULT_OBJECT_TTL_SECS),
            auto_persist: true,
            allow_null: false,
            sweep_policy: SweepPolicy::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl ObjectCacheConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = enabled;
        self
    }

    pub fn with_allow_null(mut self, enabled: bool) -> Self {
        self.allow_null = enabled;
        self
    }

    pub fn with_sweep_policy(mut self, policy: SweepPolicy) -> Self {
        self.sweep_policy = policy;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Settings for the query result cache (tier 3).
#[derive(Debug, Clone)]
pub struct QueryCacheConfig {
    pub mode: QueryCacheMode,
    /// Period of the expiry sweep (time-limited mode only)
    pub sweep_interval: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            mode: QueryCacheMode::from_setting(DEFAULT_QUERY_CACHE_MODE),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl QueryCacheConfig {
    pub fn new(mode: QueryCacheMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

// == Process Config ==
/// Process-wide cache configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub list: ListCacheConfig,
    pub object: ObjectCacheConfig,
    pub query: QueryCacheConfig,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `QUERY_CACHE_MODE` - -2 disabled, -1 per request, 0 permanent, n>0 TTL seconds (default: -2)
    /// - `SWEEP_INTERVAL_SECS` - Sweep period for tiers 2 and 3 (default: 5)
    /// - `LIST_CACHE_TTL` - List cache TTL in seconds (default: 300)
    /// - `LIST_CACHE_ASYNC` - Background refresh of warm lists (default: true)
    /// - `LIST_CACHE_STATS_EVERY` - Hit-rate log period in accesses (default: 1000)
    /// - `OBJECT_CACHE_MAX_ENTRIES` - Single-object capacity (default: 1000)
    /// - `OBJECT_CACHE_TTL` - Single-object TTL in seconds (default: 300)
    /// - `OBJECT_CACHE_AUTO_PERSIST` - Flush on evict and sweep (default: true)
    /// - `OBJECT_CACHE_ALLOW_NULL` - Cache "not found" results (default: false)
    /// - `OBJECT_CACHE_SWEEP_POLICY` - `expired` or `always` (default: expired)
    /// - `FETCH_TIMEOUT_SECS` - Upper bound on a single fetch (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable lookup.
    ///
    /// Missing or unparseable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(default)
        };

        let sweep_interval = Duration::from_secs(
            parsed("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );
        let fetch_timeout = Duration::from_secs(
            parsed("FETCH_TIMEOUT_SECS").unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        );

        let list = ListCacheConfig {
            ttl: Duration::from_secs(parsed("LIST_CACHE_TTL").unwrap_or(DEFAULT_LIST_TTL_SECS)),
            async_refresh: flag("LIST_CACHE_ASYNC", true),
            stats_log_every: parsed("LIST_CACHE_STATS_EVERY").unwrap_or(DEFAULT_STATS_EVERY),
            fetch_timeout,
        };

        let sweep_policy = lookup("OBJECT_CACHE_SWEEP_POLICY")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let object = ObjectCacheConfig {
            max_entries: lookup("OBJECT_CACHE_MAX_ENTRIES")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_ENTRIES)
                .max(1),
            ttl: Duration::from_secs(parsed("OBJECT_CACHE_TTL").unwrap_or(DEFAULT_OBJECT_TTL_SECS)),
            auto_persist: flag("OBJECT_CACHE_AUTO_PERSIST", true),
            allow_null: flag("OBJECT_CACHE_ALLOW_NULL", false),
            sweep_policy,
            sweep_interval,
            fetch_timeout,
        };

        let mode = lookup("QUERY_CACHE_MODE")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_QUERY_CACHE_MODE);

        Self {
            list,
            object,
            query: QueryCacheConfig {
                mode: QueryCacheMode::from_setting(mode),
                sweep_interval,
            },
        }
    }
}
