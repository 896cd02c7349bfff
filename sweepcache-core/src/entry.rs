use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Longest sliding expiration a policy may request
pub const MAX_SLIDING_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Smallest forward move of a sliding expiry worth re-filing the entry for
const MIN_SLIDING_UPDATE_SECS: i64 = 1;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovedReason {
    /// Explicitly removed or replaced by a newer value for the same key
    Removed,
    /// Its absolute (or renewed sliding) expiration passed
    Expired,
    /// Trimmed as one of the least recently used entries
    Evicted,
}

/// Eviction priority of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePriority {
    /// May be evicted by usage trims
    #[default]
    Default,
    /// Never evicted by usage trims; still expires and can be removed
    NotRemovable,
}

/// Passed to a removed callback once an entry has left the cache
#[derive(Debug)]
pub struct RemovedArguments<V> {
    pub key: String,
    pub value: Arc<V>,
    pub reason: RemovedReason,
}

/// Callback invoked after an entry has been removed, outside of any cache lock
pub type RemovedCallback<V> = Arc<dyn Fn(&RemovedArguments<V>) + Send + Sync>;

/// How an inserted value expires and whether it can be evicted
///
/// # Example
///
/// ```rust
/// use sweepcache_core::{CacheItemPolicy, CachePriority};
/// use std::time::Duration;
///
/// let policy: CacheItemPolicy<String> = CacheItemPolicy::new()
///     .with_sliding_expiration(Duration::from_secs(300))
///     .with_priority(CachePriority::NotRemovable);
/// assert!(policy.validate().is_ok());
/// ```
pub struct CacheItemPolicy<V> {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CachePriority,
    pub removed_callback: Option<RemovedCallback<V>>,
}

impl<V> Default for CacheItemPolicy<V> {
    fn default() -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: None,
            priority: CachePriority::Default,
            removed_callback: None,
        }
    }
}

impl<V> Clone for CacheItemPolicy<V> {
    fn clone(&self) -> Self {
        Self {
            absolute_expiration: self.absolute_expiration,
            sliding_expiration: self.sliding_expiration,
            priority: self.priority,
            removed_callback: self.removed_callback.clone(),
        }
    }
}

impl<V> fmt::Debug for CacheItemPolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItemPolicy")
            .field("absolute_expiration", &self.absolute_expiration)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("priority", &self.priority)
            .field("removed_callback", &self.removed_callback.is_some())
            .finish()
    }
}

impl<V> CacheItemPolicy<V> {
    /// A policy that never expires and may be evicted
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires the entry at a fixed UTC time
    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    /// Expires the entry `window` after its last read
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Registers a callback fired once the entry leaves the cache
    ///
    /// The callback runs on the thread that removed the entry. When that is a
    /// sweep, inserts into the same cache from inside the callback wait out
    /// the configured insert block timeout.
    pub fn on_removed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RemovedArguments<V>) + Send + Sync + 'static,
    {
        self.removed_callback = Some(Arc::new(callback));
        self
    }

    /// Rejects policies the cache cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.absolute_expiration.is_some() && self.sliding_expiration.is_some() {
            return Err(CacheError::ConflictingExpiration);
        }
        if let Some(window) = self.sliding_expiration {
            if window > MAX_SLIDING_EXPIRATION {
                return Err(CacheError::SlidingExpirationOutOfRange(window));
            }
        }
        Ok(())
    }
}

/// Position of an entry in the usage index: last access time plus a
/// tie-break for accesses that share a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsageStamp {
    pub at: DateTime<Utc>,
    pub index: u64,
}

/// Membership marker an index keeps on each entry.
///
/// Invalid while the entry is not filed in that index; otherwise it holds the
/// exact key the entry is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryRef<K>(Option<K>);

impl<K: Copy> EntryRef<K> {
    /// The marker of an entry that is not filed
    pub const INVALID: Self = EntryRef(None);

    pub(crate) fn new(key: K) -> Self {
        EntryRef(Some(key))
    }

    pub fn is_invalid(&self) -> bool {
        self.0.is_none()
    }

    /// The key the entry is filed under, if any
    pub fn key(&self) -> Option<K> {
        self.0
    }

    /// Returns the filed key and leaves the marker invalid
    pub(crate) fn take(&mut self) -> Option<K> {
        self.0.take()
    }
}

impl<K: Copy> Default for EntryRef<K> {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Ordering fields and index markers, guarded by the entry's own lock.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) utc_abs_exp: DateTime<Utc>,
    pub(crate) utc_last_update_usage: DateTime<Utc>,
    pub(crate) usage_index: u64,
    pub(crate) expires_ref: EntryRef<DateTime<Utc>>,
    pub(crate) usage_ref: EntryRef<UsageStamp>,
}

/// A cached value with its expiration and recency bookkeeping
pub struct CacheEntry<V> {
    id: u64,
    key: String,
    value: Arc<V>,
    utc_created: DateTime<Utc>,
    sliding_expiration: Option<Duration>,
    priority: CachePriority,
    removed_callback: Option<RemovedCallback<V>>,
    state: Mutex<EntryState>,
    removed: AtomicBool,
}

impl<V> CacheEntry<V> {
    /// Creates an entry stamped at `now`; the policy is assumed validated
    pub(crate) fn new(
        key: impl Into<String>,
        value: Arc<V>,
        policy: CacheItemPolicy<V>,
        now: DateTime<Utc>,
    ) -> Self {
        let utc_abs_exp = match (policy.absolute_expiration, policy.sliding_expiration) {
            (Some(at), _) => at,
            (None, Some(window)) => add_duration(now, window),
            (None, None) => DateTime::<Utc>::MAX_UTC,
        };

        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            value,
            utc_created: now,
            sliding_expiration: policy.sliding_expiration,
            priority: policy.priority,
            removed_callback: policy.removed_callback,
            state: Mutex::new(EntryState {
                utc_abs_exp,
                utc_last_update_usage: now,
                usage_index: 0,
                expires_ref: EntryRef::INVALID,
                usage_ref: EntryRef::INVALID,
            }),
            removed: AtomicBool::new(false),
        }
    }

    /// Process-unique identity, the last tie-break in every index
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the stored value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns a shared reference to the stored value (zero-cost clone)
    pub fn value_shared(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }

    pub fn utc_created(&self) -> DateTime<Utc> {
        self.utc_created
    }

    pub fn sliding_expiration(&self) -> Option<Duration> {
        self.sliding_expiration
    }

    pub fn priority(&self) -> CachePriority {
        self.priority
    }

    /// Current absolute expiration; `MAX_UTC` when the entry never expires
    pub fn utc_abs_exp(&self) -> DateTime<Utc> {
        self.state.lock().utc_abs_exp
    }

    pub fn utc_last_update_usage(&self) -> DateTime<Utc> {
        self.state.lock().utc_last_update_usage
    }

    /// Tie-break among entries stamped with the same usage time
    pub fn usage_index(&self) -> u64 {
        self.state.lock().usage_index
    }

    pub fn expires_ref(&self) -> EntryRef<DateTime<Utc>> {
        self.state.lock().expires_ref
    }

    pub fn usage_ref(&self) -> EntryRef<UsageStamp> {
        self.state.lock().usage_ref
    }

    /// Whether the entry belongs in the expiration index at all
    pub fn is_expirable(&self) -> bool {
        self.utc_abs_exp() != DateTime::<Utc>::MAX_UTC
    }

    /// Checks if this entry has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.utc_abs_exp()
    }

    /// Whether usage trims may evict this entry
    pub fn is_removable(&self) -> bool {
        self.priority != CachePriority::NotRemovable
    }

    /// Whether the entry has left its cache
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Flags the entry as removed; `true` only for the first caller
    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    /// The renewed expiry for a read at `now`, if it is worth re-filing for
    pub(crate) fn sliding_renewal(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = self.sliding_expiration?;
        let renewed = add_duration(now, window);
        let current = self.utc_abs_exp();
        if renewed - current >= chrono::Duration::seconds(MIN_SLIDING_UPDATE_SECS) || renewed < current {
            Some(renewed)
        } else {
            None
        }
    }

    /// Runs the removed callback, if any
    pub(crate) fn notify_removed(&self, reason: RemovedReason) {
        if let Some(callback) = &self.removed_callback {
            callback(&RemovedArguments {
                key: self.key.clone(),
                value: Arc::clone(&self.value),
                reason,
            });
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("utc_abs_exp", &state.utc_abs_exp)
            .field("utc_last_update_usage", &state.utc_last_update_usage)
            .field("usage_index", &state.usage_index)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// Adds a std duration to a UTC time, saturating at `MAX_UTC`
pub(crate) fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
