//! Ordered, non-owning index over cache entries.
//!
//! An [`EntryCollection`] files entries under a key chosen by an
//! [`EntryHelper`] and hands the smallest ones back to the owning store when
//! flushed. The store owns the entries; the collection only records
//! membership and order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::entry::{CacheEntry, EntryRef, EntryState, RemovedReason};

/// What an index needs from the store that owns its entries.
///
/// `remove_entry` is expected to unfile the entry from every index before it
/// returns. Flushes call it with no index lock held, so it may re-enter
/// `remove` on the index that is flushing.
pub trait CacheOwner<V>: Send + Sync {
    /// Asks the store to hold back inserts until `unblock_insert`
    fn block_insert(&self);

    fn unblock_insert(&self);

    /// Removes this exact entry from the store for `reason`
    fn remove_entry(&self, entry: &Arc<CacheEntry<V>>, reason: RemovedReason);
}

/// Ordering strategy of a collection.
///
/// Entries compare by `Key`, then by entry id, so two distinct entries never
/// compare equal.
pub(crate) trait EntryHelper: Send + Sync + 'static {
    type Key: Ord + Copy + fmt::Debug + Send + Sync;

    /// The key the entry should be filed under given its current state
    fn sort_key(state: &EntryState) -> Self::Key;

    /// The timestamp a flush compares against its limit
    fn date_time(key: &Self::Key) -> DateTime<Utc>;

    /// The membership marker this ordering keeps on the entry
    fn entry_ref(state: &mut EntryState) -> &mut EntryRef<Self::Key>;
}

/// Calls `unblock_insert` when dropped, even if a removal callback panics
struct InsertBlock<'a, V> {
    owner: &'a dyn CacheOwner<V>,
}

impl<'a, V> InsertBlock<'a, V> {
    fn new(owner: &'a dyn CacheOwner<V>) -> Self {
        owner.block_insert();
        Self { owner }
    }
}

impl<V> Drop for InsertBlock<'_, V> {
    fn drop(&mut self) {
        self.owner.unblock_insert();
    }
}

pub(crate) struct EntryCollection<H: EntryHelper, V> {
    entries: Mutex<BTreeMap<(H::Key, u64), Arc<CacheEntry<V>>>>,
    owner: Weak<dyn CacheOwner<V>>,
    _helper: PhantomData<fn() -> H>,
}

impl<H, V> EntryCollection<H, V>
where
    H: EntryHelper,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(owner: Weak<dyn CacheOwner<V>>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            owner,
            _helper: PhantomData,
        }
    }

    /// Files the entry under its current key
    pub(crate) fn add(&self, entry: &Arc<CacheEntry<V>>) {
        self.add_with(entry, |_| {});
    }

    /// Files the entry after `stamp` has updated its ordering fields.
    ///
    /// `stamp` runs under the collection lock. An entry that is already
    /// filed is moved rather than filed twice.
    pub(crate) fn add_with(&self, entry: &Arc<CacheEntry<V>>, stamp: impl FnOnce(&mut EntryState)) {
        let mut entries = self.entries.lock();
        let mut state = entry.state();

        if let Some(stale) = H::entry_ref(&mut state).take() {
            entries.remove(&(stale, entry.id()));
        }

        stamp(&mut state);
        let key = H::sort_key(&state);
        entries.insert((key, entry.id()), Arc::clone(entry));
        *H::entry_ref(&mut state) = EntryRef::new(key);
    }

    /// Unfiles the entry and invalidates its marker.
    ///
    /// Returns `false` if the entry was not filed here.
    pub(crate) fn remove(&self, entry: &Arc<CacheEntry<V>>) -> bool {
        let mut entries = self.entries.lock();
        let mut state = entry.state();

        match H::entry_ref(&mut state).take() {
            Some(key) => entries.remove(&(key, entry.id())).is_some(),
            None => false,
        }
    }

    /// Applies `mutate` to the entry's ordering fields and re-files it under
    /// the resulting key, atomically.
    ///
    /// An entry that is not filed gets the mutation but stays unfiled, so a
    /// concurrent removal is never undone. Returns whether it was re-filed.
    pub(crate) fn resplice_with(
        &self,
        entry: &Arc<CacheEntry<V>>,
        mutate: impl FnOnce(&mut EntryState),
    ) -> bool {
        let mut entries = self.entries.lock();
        let mut state = entry.state();

        let Some(old) = H::entry_ref(&mut state).take() else {
            mutate(&mut state);
            return false;
        };

        entries.remove(&(old, entry.id()));
        mutate(&mut state);
        let key = H::sort_key(&state);
        entries.insert((key, entry.id()), Arc::clone(entry));
        *H::entry_ref(&mut state) = EntryRef::new(key);
        true
    }

    /// Hands entries due at or before `limit` to the owner, smallest first.
    ///
    /// Stops at the first entry past `limit` or after `count` entries. The
    /// collection lock is released around every owner call, so entries added
    /// concurrently may or may not be seen by this pass. Each flushed entry
    /// is also unfiled here, which keeps the loop finite even when the owner
    /// declines to remove it.
    pub(crate) fn flush_items(
        &self,
        limit: DateTime<Utc>,
        reason: RemovedReason,
        block_insert: bool,
        count: Option<usize>,
    ) -> usize {
        let max = count.unwrap_or(usize::MAX);
        if max == 0 {
            return 0;
        }
        let Some(owner) = self.owner.upgrade() else {
            return 0;
        };

        let _block = block_insert.then(|| InsertBlock::new(&*owner));

        let mut flushed = 0;
        while flushed < max {
            let Some(entry) = self.first_due(limit) else {
                break;
            };
            owner.remove_entry(&entry, reason);
            self.remove(&entry);
            flushed += 1;
        }

        flushed
    }

    fn first_due(&self, limit: DateTime<Utc>) -> Option<Arc<CacheEntry<V>>> {
        let entries = self.entries.lock();
        let ((key, _), entry) = entries.first_key_value()?;
        (H::date_time(key) <= limit).then(|| Arc::clone(entry))
    }

    /// Snapshot of the filed entries in ascending order
    pub(crate) fn entries_in_order(&self) -> Vec<Arc<CacheEntry<V>>> {
        self.entries.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether the owning store still exists
    pub(crate) fn owner_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}
