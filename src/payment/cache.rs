//! LRU cache of consumed settlements.
//!
//! A verified settlement releases its resource once. The transaction hash is
//! recorded here when it does, and any later attempt to spend the same
//! settlement again is refused.

use alloy::primitives::TxHash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default cache capacity (100,000 entries ≈ 3.2MB of hashes).
const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// LRU set of settlements that already released a resource.
///
/// Eviction only forgets the oldest settlements; a node that must refuse
/// replays forever needs a capacity above its lifetime settlement count.
#[derive(Clone)]
pub struct ConsumedSettlements {
    inner: Arc<Mutex<LruCache<TxHash, u64>>>,
    stats: Arc<Mutex<ConsumptionStats>>,
}

/// Replay guard statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct ConsumptionStats {
    /// Settlements consumed for the first time.
    pub consumed: u64,
    /// Attempts to consume a settlement twice.
    pub replays_rejected: u64,
}

impl ConsumptionStats {
    /// Share of consumption attempts that were replays, as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn replay_rate(&self) -> f64 {
        let total = self.consumed + self.replays_rejected;
        if total == 0 {
            0.0
        } else {
            (self.replays_rejected as f64 / total as f64) * 100.0
        }
    }
}

impl ConsumedSettlements {
    /// Create a new cache with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create a new cache with the specified capacity (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(ConsumptionStats::default())),
        }
    }

    /// Mark `tx` as consumed for `resource_id`.
    ///
    /// Returns `false` if the settlement was already consumed. Check and
    /// insert happen under one lock, so two racing callers cannot both win.
    pub fn try_consume(&self, tx: TxHash, resource_id: u64) -> bool {
        let fresh = {
            let mut cache = self.inner.lock();
            if cache.contains(&tx) {
                false
            } else {
                cache.put(tx, resource_id);
                true
            }
        };

        let mut stats = self.stats.lock();
        if fresh {
            stats.consumed += 1;
        } else {
            stats.replays_rejected += 1;
        }
        fresh
    }

    /// Forget `tx`, making it consumable again.
    ///
    /// Used when a reserved settlement could not be confirmed yet, so the
    /// payer can still redeem it later. Returns `false` if `tx` was unknown.
    pub fn release(&self, tx: &TxHash) -> bool {
        self.inner.lock().pop(tx).is_some()
    }

    /// Resource a settlement was consumed for, if it is still remembered.
    #[must_use]
    pub fn consumed_for(&self, tx: &TxHash) -> Option<u64> {
        self.inner.lock().peek(tx).copied()
    }

    /// Get current statistics.
    #[must_use]
    pub fn stats(&self) -> ConsumptionStats {
        self.stats.lock().clone()
    }

    /// Get the current number of remembered settlements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if nothing has been consumed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for ConsumedSettlements {
    fn default() -> Self {
        Self::new()
    }
}
