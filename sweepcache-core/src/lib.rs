//! # Sweepcache Core
//!
//! An in-memory cache whose eviction bookkeeping lives in two ordered indexes.
//!
//! ## Features
//!
//! - Thread-safe storage using `DashMap`
//! - Expiration index ordered by absolute expiry, swept by a background timer
//! - Usage index ordered by last access, trimmed least recently used first
//! - Absolute and sliding expiration, non-removable priority, removal callbacks
//! - Pluggable clock for deterministic expiry in tests
//!
//! The indexes never own entries. A sweep hands each due entry back to the
//! store through [`CacheOwner`], and the store unfiles it from every index
//! before the sweep looks at the next one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sweepcache_core::{CacheConfig, CacheItemPolicy, MemoryCache, RemovedArguments};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> sweepcache_core::Result<()> {
//!     // Sweep expired entries every 5 seconds, keep at most 10k entries
//!     let config = CacheConfig::default()
//!         .with_polling_interval(Duration::from_secs(5))
//!         .with_max_entries(10_000);
//!     let cache: MemoryCache<String> = MemoryCache::with_config(config)?;
//!
//!     // Expire 60 seconds after the last read and log the removal
//!     let policy = CacheItemPolicy::new()
//!         .with_sliding_expiration(Duration::from_secs(60))
//!         .on_removed(|args: &RemovedArguments<String>| {
//!             println!("{} left the cache: {:?}", args.key, args.reason);
//!         });
//!     cache.set("user:123", "John Doe".to_string(), policy)?;
//!
//!     if let Some(value) = cache.get("user:123") {
//!         println!("User: {}", value);
//!     }
//!
//!     // Evict a quarter of the entries under memory pressure
//!     let evicted = cache.trim(25);
//!     println!("Evicted {}", evicted);
//!     Ok(())
//! }
//! ```

mod clock;
mod collection;
mod config;
mod entry;
mod error;
mod expires;
mod store;
mod usage;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::CacheOwner;
pub use config::{CacheConfig, DEFAULT_INSERT_BLOCK_TIMEOUT, DEFAULT_POLLING_INTERVAL};
pub use entry::{
    CacheEntry, CacheItemPolicy, CachePriority, EntryRef, RemovedArguments, RemovedCallback,
    RemovedReason, UsageStamp, MAX_SLIDING_EXPIRATION,
};
pub use error::{CacheError, Result};
pub use expires::ExpiresIndex;
pub use store::MemoryCache;
pub use usage::UsageIndex;
