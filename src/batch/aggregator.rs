//! Aggregator Strategy Interface
//!
//! An aggregator is the in-memory working set of one [`Batcher`]. It is
//! never shared directly: the batcher owns it behind a lock and is the only
//! caller of the mutating methods.
//!
//! Lookups are split into two narrow capabilities so that each strategy
//! only exposes the lookup it can actually answer:
//!
//! - [`ExactLookup`]: point lookup by unique key (deduplicating strategy)
//! - [`ScanLookup`]: predicate scan within a group (append strategies)
//!
//! [`Batcher`]: crate::batch::Batcher

/// In-memory accumulation strategy for batched items.
pub trait Aggregator<T>: Send + Sync {
    /// Insert or update `item` according to the strategy.
    fn add(&mut self, item: T);

    /// Number of logically distinct entries currently held.
    fn count(&self) -> usize;

    /// Pending figure for one group.
    ///
    /// The meaning differs per strategy:
    /// - append strategies: number of raw pending items in the group
    /// - deduplicating strategy: number of distinct keys touched in the
    ///   group since the last clear (not the net signed contribution)
    ///
    /// Unknown groups return 0.
    fn count_by_group(&self, group: &str) -> usize;

    /// Copy of the current contents.
    fn aggregate(&self) -> Vec<T>;

    /// Reset to empty.
    fn clear(&mut self);

    /// Snapshot and clear in one step.
    fn drain(&mut self) -> Vec<T> {
        let snapshot = self.aggregate();
        self.clear();
        snapshot
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Direct lookup by unique key.
pub trait ExactLookup<T> {
    fn lookup(&self, key: &str) -> Option<&T>;
}

/// First item in `group` matching a caller-supplied predicate.
pub trait ScanLookup<T> {
    fn scan<P>(&self, group: &str, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool;
}
