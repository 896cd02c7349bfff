//! Expiration index: entries ordered by absolute expiry, swept periodically.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::collection::{CacheOwner, EntryCollection, EntryHelper};
use crate::entry::{CacheEntry, EntryRef, EntryState, RemovedReason};
use crate::error::{CacheError, Result};

pub(crate) struct ExpiresHelper;

impl EntryHelper for ExpiresHelper {
    type Key = DateTime<Utc>;

    fn sort_key(state: &EntryState) -> Self::Key {
        state.utc_abs_exp
    }

    fn date_time(key: &Self::Key) -> DateTime<Utc> {
        *key
    }

    fn entry_ref(state: &mut EntryState) -> &mut EntryRef<Self::Key> {
        &mut state.expires_ref
    }
}

/// Handle to the background sweep; dropping it stops the sweep.
struct ExpirationTimer {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirationTimer {
    fn start<V>(
        runtime: &tokio::runtime::Handle,
        collection: Arc<EntryCollection<ExpiresHelper, V>>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        sweeps: Arc<AtomicU64>,
    ) -> Self
    where
        V: Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(sweep_task(collection, clock, interval, sweeps, shutdown_rx));
        Self { shutdown_tx }
    }
}

impl Drop for ExpirationTimer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Background task that periodically flushes expired entries
async fn sweep_task<V>(
    collection: Arc<EntryCollection<ExpiresHelper, V>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    sweeps: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    V: Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first sweep waits a full interval
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !collection.owner_alive() {
                    break;
                }
                // Removal callbacks and insert-gate waits block; a panicking
                // callback fails this sweep only
                let now = clock.now();
                let sweep = Arc::clone(&collection);
                let result = tokio::task::spawn_blocking(move || {
                    sweep.flush_items(now, RemovedReason::Expired, true, None)
                })
                .await;
                sweeps.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(flushed) if flushed > 0 => {
                        tracing::debug!(flushed, "Expiration sweep removed entries");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Expiration sweep failed");
                    }
                }
            }
        }
    }

    tracing::debug!("Expiration sweep task stopped");
}

/// Entries ordered by absolute expiration time.
///
/// The index does not own entries: [`flush_expired_items`](Self::flush_expired_items)
/// hands each due entry to the [`CacheOwner`], which removes it from the
/// cache and from this index.
pub struct ExpiresIndex<V> {
    collection: Arc<EntryCollection<ExpiresHelper, V>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    timer: Mutex<Option<ExpirationTimer>>,
    sweeps: Arc<AtomicU64>,
}

impl<V> ExpiresIndex<V>
where
    V: Send + Sync + 'static,
{
    /// Creates an empty index whose timer, once enabled, sweeps every `interval`
    pub fn new(owner: Weak<dyn CacheOwner<V>>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            collection: Arc::new(EntryCollection::new(owner)),
            clock,
            interval,
            timer: Mutex::new(None),
            sweeps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Files the entry under its absolute expiration and gives it a fresh marker
    pub fn add(&self, entry: &Arc<CacheEntry<V>>) {
        self.collection.add(entry);
    }

    /// Unfiles the entry and invalidates its marker; `false` if it was not filed
    pub fn remove(&self, entry: &Arc<CacheEntry<V>>) -> bool {
        self.collection.remove(entry)
    }

    /// Moves the entry to a new absolute expiration (sliding renewal).
    ///
    /// An entry that is no longer filed only has its expiry updated.
    pub fn utc_update(&self, entry: &Arc<CacheEntry<V>>, utc_new_abs_exp: DateTime<Utc>) -> bool {
        self.collection
            .resplice_with(entry, |state| state.utc_abs_exp = utc_new_abs_exp)
    }

    /// Flushes every entry whose expiration is at or before now.
    ///
    /// Returns the number of entries handed to the owner.
    pub fn flush_expired_items(&self, block_insert: bool) -> usize {
        let flushed = self.collection.flush_items(
            self.clock.now(),
            RemovedReason::Expired,
            block_insert,
            None,
        );
        if flushed > 0 {
            tracing::debug!(flushed, "Flushed expired entries");
        }
        flushed
    }

    /// Starts or stops the periodic sweep.
    ///
    /// Enabling an enabled timer and disabling a disabled one are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::NoRuntime` when enabling outside a Tokio runtime.
    pub fn enable_expiration_timer(&self, enable: bool) -> Result<()> {
        let mut timer = self.timer.lock();

        if enable {
            if timer.is_some() {
                return Ok(());
            }
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
            *timer = Some(ExpirationTimer::start(
                &runtime,
                Arc::clone(&self.collection),
                Arc::clone(&self.clock),
                self.interval,
                Arc::clone(&self.sweeps),
            ));
            tracing::debug!(interval = ?self.interval, "Expiration timer enabled");
        } else if timer.take().is_some() {
            tracing::debug!("Expiration timer disabled");
        }

        Ok(())
    }

    pub fn is_timer_enabled(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Number of sweeps the timer has run
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot of the filed entries, earliest expiration first
    pub fn entries_in_order(&self) -> Vec<Arc<CacheEntry<V>>> {
        self.collection.entries_in_order()
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{entry_expiring_at, recording_owner};
    use chrono::Duration as TimeDelta;

    fn index_with_clock(
        clock: Arc<ManualClock>,
        interval: Duration,
    ) -> (Arc<crate::testing::RecordingOwner<String>>, ExpiresIndex<String>) {
        let (owner, weak) = recording_owner::<String>();
        (owner, ExpiresIndex::new(weak, clock, interval))
    }

    fn keys(index: &ExpiresIndex<String>) -> Vec<String> {
        index
            .entries_in_order()
            .iter()
            .map(|e| e.key().to_string())
            .collect()
    }

    #[test]
    fn test_flush_expired_threshold() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (owner, index) = index_with_clock(Arc::clone(&clock), Duration::from_secs(20));

        for (key, secs) in [("plus10", 10), ("minus5", -5), ("plus5", 5), ("minus10", -10)] {
            index.add(&entry_expiring_at(key, t + TimeDelta::seconds(secs), t));
        }

        assert_eq!(index.flush_expired_items(true), 2);
        assert_eq!(owner.removed_keys(), vec!["minus10", "minus5"]);
        assert!(owner
            .removed()
            .iter()
            .all(|(_, reason)| *reason == RemovedReason::Expired));
        assert_eq!(keys(&index), vec!["plus5", "plus10"]);
        assert_eq!(owner.removed_while_blocked(), 2);
    }

    #[test]
    fn test_entries_ordered_by_expiration() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (_owner, index) = index_with_clock(clock, Duration::from_secs(20));

        for (i, secs) in [50, 10, 40, 20, 30].into_iter().enumerate() {
            index.add(&entry_expiring_at(&format!("e{}", i), t + TimeDelta::seconds(secs), t));
        }

        let expirations: Vec<_> = index.entries_in_order().iter().map(|e| e.utc_abs_exp()).collect();
        assert!(expirations.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_ref_marker_lifecycle() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (_owner, index) = index_with_clock(clock, Duration::from_secs(20));
        let at = t + TimeDelta::seconds(30);
        let entry = entry_expiring_at("a", at, t);

        index.add(&entry);
        assert!(!entry.expires_ref().is_invalid());
        assert_eq!(entry.expires_ref().key(), Some(at));

        assert!(index.remove(&entry));
        assert!(entry.expires_ref().is_invalid());
        assert!(!index.remove(&entry));

        index.add(&entry);
        assert!(!entry.expires_ref().is_invalid());
    }

    #[test]
    fn test_utc_update_moves_entry() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (owner, index) = index_with_clock(Arc::clone(&clock), Duration::from_secs(20));

        let sliding = entry_expiring_at("sliding", t + TimeDelta::seconds(1), t);
        let fixed = entry_expiring_at("fixed", t + TimeDelta::seconds(10), t);
        index.add(&sliding);
        index.add(&fixed);

        let renewed = t + TimeDelta::seconds(60);
        assert!(index.utc_update(&sliding, renewed));
        assert_eq!(sliding.utc_abs_exp(), renewed);
        assert_eq!(keys(&index), vec!["fixed", "sliding"]);

        clock.advance(TimeDelta::seconds(30));
        assert_eq!(index.flush_expired_items(false), 1);
        assert_eq!(owner.removed_keys(), vec!["fixed"]);
    }

    #[test]
    fn test_utc_update_of_unfiled_entry() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (_owner, index) = index_with_clock(clock, Duration::from_secs(20));
        let entry = entry_expiring_at("a", t, t);

        assert!(!index.utc_update(&entry, t + TimeDelta::seconds(5)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_disable_never_enabled_timer_is_noop() {
        let clock = Arc::new(ManualClock::starting_now());
        let (_owner, index) = index_with_clock(clock, Duration::from_secs(20));

        assert!(index.enable_expiration_timer(false).is_ok());
        assert!(!index.is_timer_enabled());
    }

    #[test]
    fn test_enable_without_runtime_fails() {
        let clock = Arc::new(ManualClock::starting_now());
        let (_owner, index) = index_with_clock(clock, Duration::from_secs(20));

        assert_eq!(index.enable_expiration_timer(true), Err(CacheError::NoRuntime));
        assert!(!index.is_timer_enabled());
    }

    #[tokio::test]
    async fn test_timer_sweeps_expired_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let t = clock.now();
        let (owner, index) = index_with_clock(Arc::clone(&clock), Duration::from_millis(50));

        index.add(&entry_expiring_at("expired", t - TimeDelta::seconds(1), t));
        index.add(&entry_expiring_at("alive", t + TimeDelta::seconds(60), t));

        index.enable_expiration_timer(true).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(owner.removed(), vec![("expired".to_string(), RemovedReason::Expired)]);
        assert_eq!(keys(&index), vec!["alive"]);
        assert!(index.sweep_count() >= 1);
    }

    #[tokio::test]
    async fn test_enabling_twice_keeps_one_timer() {
        let clock = Arc::new(ManualClock::starting_now());
        let (_owner, index) = index_with_clock(clock, Duration::from_millis(100));

        index.enable_expiration_timer(true).unwrap();
        index.enable_expiration_timer(true).unwrap();
        assert!(index.is_timer_enabled());

        tokio::time::sleep(Duration::from_millis(250)).await;

        // One timer ticks twice in 250ms; two timers would tick four times
        let sweeps = index.sweep_count();
        assert!((1..=3).contains(&sweeps), "unexpected sweep count {}", sweeps);
    }

    #[tokio::test]
    async fn test_disable_then_enable_restarts_sweeping() {
        let clock = Arc::new(ManualClock::starting_now());
        let (_owner, index) = index_with_clock(clock, Duration::from_millis(40));

        index.enable_expiration_timer(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        index.enable_expiration_timer(false).unwrap();
        assert!(!index.is_timer_enabled());

        // Let the stopped task observe its shutdown signal
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stopped_at = index.sweep_count();
        assert!(stopped_at >= 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(index.sweep_count(), stopped_at);

        index.enable_expiration_timer(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(index.sweep_count() > stopped_at);
    }

    #[tokio::test]
    async fn test_timer_stops_when_owner_is_gone() {
        let clock = Arc::new(ManualClock::starting_now());
        let (owner, index) = index_with_clock(clock, Duration::from_millis(30));

        index.enable_expiration_timer(true).unwrap();
        drop(owner);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(index.sweep_count(), 0);
    }
}
