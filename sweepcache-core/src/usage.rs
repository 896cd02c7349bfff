//! Usage index: entries ordered by last access, trimmed least recent first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::clock::Clock;
use crate::collection::{CacheOwner, EntryCollection, EntryHelper};
use crate::entry::{CacheEntry, EntryRef, EntryState, RemovedReason, UsageStamp};

pub(crate) struct UsageHelper;

impl EntryHelper for UsageHelper {
    type Key = UsageStamp;

    fn sort_key(state: &EntryState) -> Self::Key {
        UsageStamp {
            at: state.utc_last_update_usage,
            index: state.usage_index,
        }
    }

    fn date_time(key: &Self::Key) -> DateTime<Utc> {
        key.at
    }

    fn entry_ref(state: &mut EntryState) -> &mut EntryRef<Self::Key> {
        &mut state.usage_ref
    }
}

/// Last stamp handed out; only touched under the collection lock
#[derive(Debug)]
struct TieBreak {
    prev: DateTime<Utc>,
    index: u64,
}

/// Entries ordered by recency of use.
///
/// Entries stamped within the same clock reading keep insertion order through
/// a per-timestamp index. A clock that steps backwards is treated as not
/// having moved, so stamps never go down.
pub struct UsageIndex<V> {
    collection: EntryCollection<UsageHelper, V>,
    clock: Arc<dyn Clock>,
    tie_break: Mutex<TieBreak>,
}

impl<V> UsageIndex<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(owner: Weak<dyn CacheOwner<V>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            collection: EntryCollection::new(owner),
            clock,
            tie_break: Mutex::new(TieBreak {
                prev: DateTime::<Utc>::MIN_UTC,
                index: 0,
            }),
        }
    }

    /// Stamps the entry as used now and files it as the most recent
    pub fn add(&self, entry: &Arc<CacheEntry<V>>) {
        self.collection.add_with(entry, |state| self.stamp(state));
    }

    /// Unfiles the entry and invalidates its marker; `false` if it was not filed
    pub fn remove(&self, entry: &Arc<CacheEntry<V>>) -> bool {
        self.collection.remove(entry)
    }

    /// Re-stamps the entry as used now, moving it to the most recent position.
    ///
    /// An entry that is no longer filed is stamped but stays unfiled.
    pub fn update(&self, entry: &Arc<CacheEntry<V>>) -> bool {
        self.collection.resplice_with(entry, |state| self.stamp(state))
    }

    /// Evicts up to `count` of the least recently used entries, regardless of
    /// how recently they were used. Inserts are blocked for the duration.
    pub fn flush_under_used_items(&self, count: usize) -> usize {
        let flushed = self.collection.flush_items(
            DateTime::<Utc>::MAX_UTC,
            RemovedReason::Evicted,
            true,
            Some(count),
        );
        if flushed > 0 {
            tracing::debug!(requested = count, flushed, "Evicted under-used entries");
        }
        flushed
    }

    /// Snapshot of the filed entries, least recently used first
    pub fn entries_in_order(&self) -> Vec<Arc<CacheEntry<V>>> {
        self.collection.entries_in_order()
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }

    fn stamp(&self, state: &mut EntryState) {
        let now = self.clock.now();
        let mut tie_break = self.tie_break.lock();

        if now > tie_break.prev {
            tie_break.prev = now;
            tie_break.index = 0;
        } else {
            tie_break.index += 1;
        }

        state.utc_last_update_usage = tie_break.prev;
        state.usage_index = tie_break.index;
    }
}
