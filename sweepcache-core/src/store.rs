use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::collection::CacheOwner;
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, CacheItemPolicy, RemovedReason};
use crate::error::Result;
use crate::expires::ExpiresIndex;
use crate::usage::UsageIndex;

/// Internal shared state for the cache
struct StoreInner<V> {
    data: DashMap<String, Arc<CacheEntry<V>>>,
    expires: ExpiresIndex<V>,
    usage: UsageIndex<V>,
    clock: Arc<dyn Clock>,
    /// Number of sweeps currently holding inserts back
    insert_blocks: Mutex<usize>,
    insert_unblocked: Condvar,
    insert_block_timeout: Duration,
    /// Maximum number of entries (0 = unlimited)
    max_entries: usize,
    /// Serializes entry-limit evictions; re-entered by callbacks that insert
    limit_lock: ReentrantMutex<()>,
}

/// Thread-safe in-memory cache with expiration and usage-ordered eviction
///
/// Entries live in a `DashMap`; an expiration index and a usage index order
/// them for the periodic expiration sweep and for least-recently-used trims.
/// Cloning the cache yields another handle to the same data.
///
/// The expiration timer runs as a task on the Tokio runtime that was current
/// when it was enabled. It is stopped when the last handle is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use sweepcache_core::{CacheConfig, CacheItemPolicy, MemoryCache};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> sweepcache_core::Result<()> {
///     let config = CacheConfig::default()
///         .with_polling_interval(Duration::from_secs(5))
///         .with_max_entries(10_000);
///     let cache: MemoryCache<String> = MemoryCache::with_config(config)?;
///
///     let policy = CacheItemPolicy::new().with_sliding_expiration(Duration::from_secs(300));
///     cache.set("session:42", "alice".to_string(), policy)?;
///
///     if let Some(user) = cache.get("session:42") {
///         println!("User: {}", user);
///     }
///     Ok(())
/// }
/// ```
pub struct MemoryCache<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Send + Sync + 'static,
{
    /// Creates a cache with default configuration
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NoRuntime` if called outside of a Tokio runtime,
    /// since the default configuration starts the expiration timer.
    pub fn new() -> Result<Self> {
        Self::with_config(CacheConfig::default())
    }

    /// Creates a cache with custom configuration and the system clock
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a cache that reads time from `clock`
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidConfig` for an unusable configuration and
    /// `CacheError::NoRuntime` when the timer is requested outside a runtime.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner<V>>| {
            let owner: Weak<dyn CacheOwner<V>> = weak.clone();
            StoreInner {
                data: DashMap::new(),
                expires: ExpiresIndex::new(owner.clone(), Arc::clone(&clock), config.polling_interval),
                usage: UsageIndex::new(owner, Arc::clone(&clock)),
                clock,
                insert_blocks: Mutex::new(0),
                insert_unblocked: Condvar::new(),
                insert_block_timeout: config.insert_block_timeout,
                max_entries: config.max_entries,
                limit_lock: ReentrantMutex::new(()),
            }
        });

        if config.expiration_timer {
            inner.expires.enable_expiration_timer(true)?;
        }

        Ok(Self { inner })
    }

    /// Stores a value under `key`, replacing any previous value
    ///
    /// A replaced entry is reported to its removed callback with
    /// `RemovedReason::Removed`. When the cache holds more than `max_entries`
    /// afterwards, the overflow is evicted least recently used first.
    ///
    /// # Errors
    ///
    /// Returns a policy error if the policy is invalid; nothing is stored.
    pub fn set(&self, key: impl Into<String>, value: V, policy: CacheItemPolicy<V>) -> Result<()> {
        policy.validate()?;
        self.inner.wait_for_inserts();

        let entry = Arc::new(CacheEntry::new(
            key,
            Arc::new(value),
            policy,
            self.inner.clock.now(),
        ));

        let replaced = match self.inner.data.entry(entry.key().to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let old = occupied.insert(Arc::clone(&entry));
                self.inner.unfile(&old);
                self.inner.file(&entry);
                Some(old)
            }
            MapEntry::Vacant(vacant) => {
                self.inner.file(&entry);
                vacant.insert(Arc::clone(&entry));
                None
            }
        };

        if let Some(old) = replaced {
            if old.mark_removed() {
                old.notify_removed(RemovedReason::Removed);
            }
        }

        self.inner.enforce_max_entries();
        Ok(())
    }

    /// Inserts the value unless a live entry already exists
    ///
    /// Returns the existing value when there is one, `None` when the new
    /// value was stored. An expired existing entry is replaced.
    pub fn add_or_get_existing(
        &self,
        key: impl Into<String>,
        value: V,
        policy: CacheItemPolicy<V>,
    ) -> Result<Option<Arc<V>>> {
        policy.validate()?;
        self.inner.wait_for_inserts();

        let now = self.inner.clock.now();
        let entry = Arc::new(CacheEntry::new(key, Arc::new(value), policy, now));

        let expired = match self.inner.data.entry(entry.key().to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    let existing = Arc::clone(occupied.get());
                    self.inner.usage.update(&existing);
                    return Ok(Some(existing.value_shared()));
                }
                let old = occupied.insert(Arc::clone(&entry));
                self.inner.unfile(&old);
                self.inner.file(&entry);
                Some(old)
            }
            MapEntry::Vacant(vacant) => {
                self.inner.file(&entry);
                vacant.insert(Arc::clone(&entry));
                None
            }
        };

        if let Some(old) = expired {
            if old.mark_removed() {
                old.notify_removed(RemovedReason::Expired);
            }
        }

        self.inner.enforce_max_entries();
        Ok(None)
    }

    /// Retrieves a value by key
    ///
    /// Returns `None` if the key doesn't exist or has expired; expired
    /// entries are removed on the spot. A hit renews sliding expiration and
    /// marks the entry as most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.inner.clock.now();

        let expired = {
            let entry = self.inner.data.get(key)?;
            if !entry.is_expired(now) {
                if let Some(renewed) = entry.sliding_renewal(now) {
                    self.inner.expires.utc_update(&entry, renewed);
                }
                self.inner.usage.update(&entry);
                return Some(entry.value_shared());
            }
            Arc::clone(entry.value())
        };

        self.inner.remove_entry(&expired, RemovedReason::Expired);
        None
    }

    /// Checks if a key exists and is not expired, without touching its recency
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .data
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Removes a key from the cache
    ///
    /// Returns the removed value, or `None` if the key did not exist.
    pub fn remove(&self, key: &str) -> Option<Arc<V>> {
        let (_, entry) = self.inner.data.remove(key)?;
        self.inner.unfile(&entry);
        if entry.mark_removed() {
            entry.notify_removed(RemovedReason::Removed);
        }
        Some(entry.value_shared())
    }

    /// Removes every expired entry now
    ///
    /// Returns the number of entries removed. The expiration timer does the
    /// same periodically.
    pub fn flush_expired(&self) -> usize {
        self.inner.expires.flush_expired_items(true)
    }

    /// Evicts `percent`% of the entries, least recently used first
    ///
    /// Entries with `CachePriority::NotRemovable` are never evicted.
    pub fn trim(&self, percent: u8) -> usize {
        let percent = usize::from(percent.min(100));
        let count = self.inner.data.len() * percent / 100;
        self.inner.usage.flush_under_used_items(count)
    }

    /// Starts or stops the periodic expiration sweep
    pub fn enable_expiration_timer(&self, enable: bool) -> Result<()> {
        self.inner.expires.enable_expiration_timer(enable)
    }

    pub fn is_expiration_timer_enabled(&self) -> bool {
        self.inner.expires.is_timer_enabled()
    }

    /// Returns the number of entries in the cache (including expired ones not yet swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    /// Returns `true` if the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// The expiration index, for inspection
    pub fn expires(&self) -> &ExpiresIndex<V> {
        &self.inner.expires
    }

    /// The usage index, for inspection
    pub fn usage(&self) -> &UsageIndex<V> {
        &self.inner.usage
    }
}

impl<V> StoreInner<V>
where
    V: Send + Sync + 'static,
{
    /// Adds the entry to the indexes it belongs in
    fn file(&self, entry: &Arc<CacheEntry<V>>) {
        if entry.is_expirable() {
            self.expires.add(entry);
        }
        if entry.is_removable() {
            self.usage.add(entry);
        }
    }

    fn unfile(&self, entry: &Arc<CacheEntry<V>>) {
        self.expires.remove(entry);
        self.usage.remove(entry);
    }

    /// Waits while a sweep blocks inserts, but never longer than the configured timeout
    fn wait_for_inserts(&self) {
        let mut blocks = self.insert_blocks.lock();
        if *blocks == 0 {
            return;
        }

        let deadline = Instant::now() + self.insert_block_timeout;
        while *blocks > 0 {
            if self
                .insert_unblocked
                .wait_until(&mut blocks, deadline)
                .timed_out()
            {
                tracing::warn!(
                    timeout = ?self.insert_block_timeout,
                    "Insert proceeding while a sweep is still running"
                );
                return;
            }
        }
    }

    fn enforce_max_entries(&self) {
        if self.max_entries == 0 {
            return;
        }
        // Read the length under the lock so concurrent writers never evict
        // for the same overflow twice
        let _limit = self.limit_lock.lock();
        let len = self.data.len();
        if len > self.max_entries {
            self.usage.flush_under_used_items(len - self.max_entries);
        }
    }
}

impl<V> CacheOwner<V> for StoreInner<V>
where
    V: Send + Sync + 'static,
{
    fn block_insert(&self) {
        *self.insert_blocks.lock() += 1;
    }

    fn unblock_insert(&self) {
        let mut blocks = self.insert_blocks.lock();
        *blocks = blocks.saturating_sub(1);
        if *blocks == 0 {
            self.insert_unblocked.notify_all();
        }
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry<V>>, reason: RemovedReason) {
        // Only this exact entry; a newer value under the same key stays
        let removed = self
            .data
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry))
            .is_some();

        self.unfile(entry);

        if removed && entry.mark_removed() {
            entry.notify_removed(reason);
        }
    }
}
