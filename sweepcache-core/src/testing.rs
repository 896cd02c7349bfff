//! Shared fixtures for the index test suites.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::collection::CacheOwner;
use crate::entry::{CacheEntry, CacheItemPolicy, RemovedReason};

type RemoveHook<V> = Box<dyn Fn(&Arc<CacheEntry<V>>) + Send + Sync>;

/// A `CacheOwner` that records what it was asked to do
pub(crate) struct RecordingOwner<V> {
    removed: Mutex<Vec<(String, RemovedReason)>>,
    blocked: AtomicUsize,
    block_calls: AtomicUsize,
    removed_while_blocked: AtomicUsize,
    hook: Mutex<Option<RemoveHook<V>>>,
}

impl<V> RecordingOwner<V> {
    pub(crate) fn removed(&self) -> Vec<(String, RemovedReason)> {
        self.removed.lock().clone()
    }

    pub(crate) fn removed_keys(&self) -> Vec<String> {
        self.removed.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    pub(crate) fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn blocked_now(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    pub(crate) fn removed_while_blocked(&self) -> usize {
        self.removed_while_blocked.load(Ordering::SeqCst)
    }

    /// Runs `hook` on every removal, standing in for the store unfiling
    pub(crate) fn on_remove<F>(&self, hook: F)
    where
        F: Fn(&Arc<CacheEntry<V>>) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl<V: Send + Sync> CacheOwner<V> for RecordingOwner<V> {
    fn block_insert(&self) {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.blocked.fetch_add(1, Ordering::SeqCst);
    }

    fn unblock_insert(&self) {
        self.blocked.fetch_sub(1, Ordering::SeqCst);
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry<V>>, reason: RemovedReason) {
        if self.blocked.load(Ordering::SeqCst) > 0 {
            self.removed_while_blocked.fetch_add(1, Ordering::SeqCst);
        }
        self.removed.lock().push((entry.key().to_string(), reason));
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(entry);
        }
    }
}

/// A recording owner plus the weak handle indexes are built with
pub(crate) fn recording_owner<V>() -> (Arc<RecordingOwner<V>>, Weak<dyn CacheOwner<V>>)
where
    V: Send + Sync + 'static,
{
    let owner = Arc::new(RecordingOwner {
        removed: Mutex::new(Vec::new()),
        blocked: AtomicUsize::new(0),
        block_calls: AtomicUsize::new(0),
        removed_while_blocked: AtomicUsize::new(0),
        hook: Mutex::new(None),
    });
    let weak: Weak<dyn CacheOwner<V>> = Arc::downgrade(&owner) as Weak<dyn CacheOwner<V>>;
    (owner, weak)
}

pub(crate) fn entry_expiring_at(key: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Arc<CacheEntry<String>> {
    Arc::new(CacheEntry::new(
        key,
        Arc::new(format!("value-{}", key)),
        CacheItemPolicy::new().with_absolute_expiration(at),
        now,
    ))
}

pub(crate) fn plain_entry(key: &str, now: DateTime<Utc>) -> Arc<CacheEntry<String>> {
    Arc::new(CacheEntry::new(
        key,
        Arc::new(format!("value-{}", key)),
        CacheItemPolicy::new(),
        now,
    ))
}
