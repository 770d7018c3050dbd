//! Batcher - Write-Behind Orchestrator
//!
//! A batcher owns one [`Aggregator`] behind a read-write lock, decides when
//! to flush, and runs the commit callback under a [`RetryPolicy`].
//!
//! ```text
//! add ──► [write lock] aggregator.add ──► count >= max_size? ──► tick
//!
//! tick ──► [commit lock] ──► [write lock] aggregator.drain ──► commit(snapshot) ──► retry / drop
//!                                                               (commit lock only)
//!
//! lookup / scan / count_by_group ──► [read lock] aggregator
//! ```
//!
//! `add` and the drain inside `tick` take the same exclusive lock, so an
//! item lands in exactly one flush snapshot. Reads take the lock shared and
//! never observe a half-drained aggregate.
//!
//! Flushes of one batcher are serialized by a separate commit lock held
//! from the drain until the commit finishes or is dropped. Snapshots reach
//! the callback in drain order, so a later restatement of a key is never
//! overwritten by an older, slower commit. Adds keep going while a commit
//! runs; only a second flush waits.
//!
//! [`RetryPolicy`]: crate::batch::RetryPolicy

use super::aggregator::{Aggregator, ExactLookup, ScanLookup};
use super::config::BatchConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Error returned by a commit callback.
///
/// The batcher never inspects it beyond logging; any error is retried the
/// same way.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The durable store failed the batch
    #[error("commit failed: {source}")]
    Failed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The callback gave up on its own
    #[error("commit aborted: {0}")]
    Aborted(String),
}

impl CommitError {
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CommitError::Failed {
            source: Box::new(error),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        CommitError::Aborted(reason.into())
    }
}

/// Commit callback: persists one flush snapshot, all or nothing.
pub type CommitFn<T> = Box<dyn Fn(&[T]) -> Result<(), CommitError> + Send + Sync>;

/// What a single [`Batcher::tick`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was pending; the callback was not called
    Empty,
    /// The snapshot was committed
    Committed { items: usize, attempts: u32 },
    /// Every attempt failed; the snapshot was discarded
    Dropped { items: usize, attempts: u32 },
}

impl TickOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TickOutcome::Committed { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, TickOutcome::Dropped { .. })
    }

    /// Items in the flushed snapshot (0 for `Empty`)
    pub fn items(&self) -> usize {
        match self {
            TickOutcome::Empty => 0,
            TickOutcome::Committed { items, .. } | TickOutcome::Dropped { items, .. } => *items,
        }
    }
}

/// Point-in-time batcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub items_added: u64,
    /// Ticks that found a non-empty snapshot
    pub flushes: u64,
    /// Ticks triggered by `add` reaching `max_size`
    pub size_triggered_flushes: u64,
    pub committed_batches: u64,
    pub committed_items: u64,
    pub failed_attempts: u64,
    pub dropped_batches: u64,
    pub dropped_items: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    items_added: AtomicU64,
    flushes: AtomicU64,
    size_triggered_flushes: AtomicU64,
    committed_batches: AtomicU64,
    committed_items: AtomicU64,
    failed_attempts: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_items: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> BatcherStats {
        BatcherStats {
            items_added: self.items_added.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            size_triggered_flushes: self.size_triggered_flushes.load(Ordering::Relaxed),
            committed_batches: self.committed_batches.load(Ordering::Relaxed),
            committed_items: self.committed_items.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            dropped_items: self.dropped_items.load(Ordering::Relaxed),
        }
    }
}

/// Write-behind batcher over one aggregator
pub struct Batcher<T, A> {
    name: String,
    config: BatchConfig,
    pending: RwLock<A>,
    /// Held across drain and commit
    commit_lock: Mutex<()>,
    commit: CommitFn<T>,
    stats: StatsCounters,
}

impl<T, A> Batcher<T, A>
where
    T: Send + 'static,
    A: Aggregator<T>,
{
    /// Create a batcher. `name` only appears in logs.
    pub fn new<F>(name: impl Into<String>, aggregator: A, config: BatchConfig, commit: F) -> Self
    where
        F: Fn(&[T]) -> Result<(), CommitError> + Send + Sync + 'static,
    {
        Batcher {
            name: name.into(),
            config,
            pending: RwLock::new(aggregator),
            commit_lock: Mutex::new(()),
            commit: Box::new(commit),
            stats: StatsCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Add an item to the open aggregate.
    ///
    /// Never fails. When the pending count reaches `max_size` the flush runs
    /// inline on the caller's thread, which then pays the commit latency
    /// including retry backoff sleeps. From async code, call it through
    /// `spawn_blocking`.
    pub fn add(&self, item: T) {
        let pending = {
            let mut aggregator = self.pending.write();
            aggregator.add(item);
            aggregator.count()
        };
        self.stats.items_added.fetch_add(1, Ordering::Relaxed);

        if pending >= self.config.max_size {
            self.stats
                .size_triggered_flushes
                .fetch_add(1, Ordering::Relaxed);
            debug!(batcher = %self.name, pending, "size threshold reached, flushing inline");
            self.tick();
        }
    }

    /// Snapshot and clear the aggregate, then commit the snapshot.
    ///
    /// The aggregate lock is held only for the drain. The commit lock is
    /// held until the snapshot is committed or dropped, so a concurrent tick
    /// waits and commits its newer snapshot afterwards. An empty snapshot
    /// returns [`TickOutcome::Empty`] without calling the callback.
    pub fn tick(&self) -> TickOutcome {
        let _flushing = self.commit_lock.lock();
        let snapshot = self.pending.write().drain();
        if snapshot.is_empty() {
            return TickOutcome::Empty;
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.commit_snapshot(snapshot)
    }

    fn commit_snapshot(&self, snapshot: Vec<T>) -> TickOutcome {
        let policy = &self.config.retry;
        let items = snapshot.len();
        let started = Instant::now();
        let mut failed: u32 = 0;

        loop {
            match (self.commit)(&snapshot) {
                Ok(()) => {
                    let attempts = failed + 1;
                    self.stats.committed_batches.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .committed_items
                        .fetch_add(items as u64, Ordering::Relaxed);
                    debug!(
                        batcher = %self.name,
                        items,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "batch committed"
                    );
                    return TickOutcome::Committed { items, attempts };
                }
                Err(e) => {
                    failed += 1;
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);

                    if !policy.may_retry(failed, started) {
                        self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .dropped_items
                            .fetch_add(items as u64, Ordering::Relaxed);
                        error!(
                            batcher = %self.name,
                            items,
                            attempts = failed,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "commit attempts exhausted, dropping batch"
                        );
                        return TickOutcome::Dropped {
                            items,
                            attempts: failed,
                        };
                    }

                    warn!(
                        batcher = %self.name,
                        attempt = failed,
                        max_attempts = policy.attempts(),
                        error = %e,
                        "commit attempt failed, retrying"
                    );
                    let backoff = policy.backoff_after(failed);
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
    }

    /// Entries in the open aggregate
    pub fn pending(&self) -> usize {
        self.pending.read().count()
    }

    /// Pending figure for `group`; see [`Aggregator::count_by_group`].
    pub fn count_by_group(&self, group: &str) -> usize {
        self.pending.read().count_by_group(group)
    }

    /// Run `f` against the open aggregate under the shared lock.
    pub fn with_pending<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        f(&self.pending.read())
    }

    pub fn stats(&self) -> BatcherStats {
        self.stats.snapshot()
    }
}

impl<T, A> Batcher<T, A>
where
    T: Clone + Send + 'static,
    A: Aggregator<T> + ExactLookup<T>,
{
    /// Pending item with unique key `key`, if any
    pub fn lookup(&self, key: &str) -> Option<T> {
        self.pending.read().lookup(key).cloned()
    }
}

impl<T, A> Batcher<T, A>
where
    T: Clone + Send + 'static,
    A: Aggregator<T> + ScanLookup<T>,
{
    /// First pending item of `group` matching `predicate`, if any
    pub fn scan<P>(&self, group: &str, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.pending.read().scan(group, predicate).cloned()
    }
}

impl<T, A> std::fmt::Debug for Batcher<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::item::{Contribution, GroupItem, KeyedGroupItem};
    use crate::batch::{KeyedAggregator, MapAggregator, RetryPolicy};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Like {
        image: u32,
        user: u32,
        liked: bool,
    }

    impl GroupItem for Like {
        fn group(&self) -> String {
            self.image.to_string()
        }
    }

    impl KeyedGroupItem for Like {
        fn key(&self) -> String {
            format!("{}:{}", self.image, self.user)
        }

        fn contribution(&self) -> Contribution {
            Contribution::from(self.liked)
        }
    }

    fn like(image: u32, user: u32, liked: bool) -> Like {
        Like { image, user, liked }
    }

    fn recording_batcher(
        config: BatchConfig,
    ) -> (Batcher<Like, KeyedAggregator<Like>>, Arc<Mutex<Vec<Vec<Like>>>>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let sink = flushed.clone();
        let batcher = Batcher::new("likes", KeyedAggregator::new(), config, move |batch: &[Like]| {
            sink.lock().push(batch.to_vec());
            Ok(())
        });
        (batcher, flushed)
    }

    #[test]
    fn test_empty_tick_skips_commit() {
        let (batcher, flushed) = recording_batcher(BatchConfig::test());
        assert_eq!(batcher.tick(), TickOutcome::Empty);
        assert!(flushed.lock().is_empty());
        assert_eq!(batcher.stats().flushes, 0);
    }

    #[test]
    fn test_tick_commits_and_clears() {
        let (batcher, flushed) = recording_batcher(BatchConfig::test());
        batcher.add(like(1, 1, true));
        batcher.add(like(1, 2, true));
        assert_eq!(batcher.pending(), 2);

        let outcome = batcher.tick();
        assert_eq!(outcome, TickOutcome::Committed { items: 2, attempts: 1 });
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.count_by_group("1"), 0);
        assert_eq!(flushed.lock().len(), 1);
        assert_eq!(flushed.lock()[0].len(), 2);
    }

    #[test]
    fn test_lookup_reflects_last_write() {
        let (batcher, _) = recording_batcher(BatchConfig::test());
        batcher.add(like(3, 9, true));
        batcher.add(like(3, 9, false));

        assert_eq!(batcher.lookup("3:9"), Some(like(3, 9, false)));
        assert_eq!(batcher.lookup("3:8"), None);
    }

    #[test]
    fn test_size_threshold_flushes_inline() {
        let (batcher, flushed) = recording_batcher(BatchConfig::test().with_max_size(3));
        batcher.add(like(1, 1, true));
        batcher.add(like(1, 2, true));
        assert!(flushed.lock().is_empty());

        batcher.add(like(1, 3, true));
        assert_eq!(flushed.lock().len(), 1);
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.stats().size_triggered_flushes, 1);
    }

    #[test]
    fn test_restating_a_key_does_not_grow_towards_threshold() {
        let (batcher, flushed) = recording_batcher(BatchConfig::test().with_max_size(2));
        for i in 0..10 {
            batcher.add(like(1, 1, i % 2 == 0));
        }
        assert!(flushed.lock().is_empty());
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn test_failing_commit_is_dropped_after_attempts() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let config = BatchConfig::test().with_retry(RetryPolicy::immediate(4));
        let batcher = Batcher::new("views", MapAggregator::new(), config, move |_: &[Like]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CommitError::aborted("store unavailable"))
        });

        batcher.add(like(1, 1, true));
        let outcome = batcher.tick();

        assert_eq!(outcome, TickOutcome::Dropped { items: 1, attempts: 4 });
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = batcher.stats();
        assert_eq!(stats.failed_attempts, 4);
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_items, 1);
        assert_eq!(stats.committed_batches, 0);
    }

    #[test]
    fn test_scan_on_map_batcher() {
        let config = BatchConfig::test();
        let batcher = Batcher::new("views", MapAggregator::new(), config, |_: &[Like]| Ok(()));
        batcher.add(like(5, 1, true));
        batcher.add(like(5, 2, true));

        assert_eq!(batcher.scan("5", |l| l.user == 2), Some(like(5, 2, true)));
        assert_eq!(batcher.scan("6", |_| true), None);
    }

    #[test]
    fn test_with_pending_exposes_aggregator() {
        let (batcher, _) = recording_batcher(BatchConfig::test());
        batcher.add(like(1, 1, true));
        batcher.add(like(1, 2, false));
        batcher.add(like(1, 3, false));

        let net = batcher.with_pending(|agg| agg.net_by_group("1"));
        assert_eq!(net, -1);
    }

    #[test]
    fn test_commit_error_display() {
        let err = CommitError::failed(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(err.to_string(), "commit failed: disk full");
        assert!(std::error::Error::source(&err).is_some());

        let err = CommitError::aborted("timeout");
        assert_eq!(err.to_string(), "commit aborted: timeout");
    }
}
