use std::time::Duration;

use crate::error::{CacheError, Result};

/// Default interval between expiration sweeps
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(20);

/// Default upper bound on how long an insert waits while a sweep blocks inserts
pub const DEFAULT_INSERT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`MemoryCache`](crate::MemoryCache)
///
/// # Example
///
/// ```rust
/// use sweepcache_core::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_polling_interval(Duration::from_secs(5))
///     .with_max_entries(10_000);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Interval between expiration sweeps (default: 20 seconds)
    pub polling_interval: Duration,
    /// Maximum number of entries before least recently used entries are
    /// evicted on insert (0 = unlimited)
    pub max_entries: usize,
    /// Whether the expiration timer starts with the cache (default: true)
    pub expiration_timer: bool,
    /// How long an insert waits for a running sweep before going ahead anyway
    pub insert_block_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_entries: 0,
            expiration_timer: true,
            insert_block_timeout: DEFAULT_INSERT_BLOCK_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from environment variables.
    ///
    /// Reads:
    /// - `SWEEPCACHE_POLLING_INTERVAL` - seconds between expiration sweeps
    /// - `SWEEPCACHE_MAX_ENTRIES` - entry limit (0 = unlimited)
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("SWEEPCACHE_POLLING_INTERVAL") {
            config.polling_interval = Duration::from_secs(secs);
        }
        if let Some(max) = env_u64("SWEEPCACHE_MAX_ENTRIES") {
            config.max_entries = usize::try_from(max).unwrap_or(usize::MAX);
        }

        config
    }

    /// Sets the interval between expiration sweeps
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the entry limit
    ///
    /// When an insert pushes the cache past this many entries, the overflow is
    /// evicted starting from the least recently used entry.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Enables or disables starting the expiration timer with the cache
    pub fn with_expiration_timer(mut self, enabled: bool) -> Self {
        self.expiration_timer = enabled;
        self
    }

    /// Sets how long inserts wait while a sweep blocks them
    pub fn with_insert_block_timeout(mut self, timeout: Duration) -> Self {
        self.insert_block_timeout = timeout;
        self
    }

    /// Checks that the configuration can drive a cache
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "polling interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not an unsigned integer", name, raw);
            None
        }
    }
}
