//! Deterministic Simulation Testing for Batchers
//!
//! Shadow-state harness that drives one [`Batcher`] with a seeded workload
//! of adds and ticks while its commit callback fails with a configured
//! probability. After a run, every event ever added must be accounted for
//! exactly once:
//!
//! ```text
//! added == committed ⊎ dropped ⊎ pending
//! ```
//!
//! For the deduplicating strategy only the last write of each key has to
//! survive; superseded writes are legitimately absent.
//!
//! ```text
//! for seed in 0..1000 {
//!     let mut harness = BatcherDstHarness::new(BatcherDstConfig::chaos(seed));
//!     harness.run(500);
//!     harness.check_invariants();
//!     assert!(harness.result().is_success(), "seed {}", seed);
//! }
//! ```

use super::aggregator::Aggregator;
use super::batcher::{Batcher, BatcherStats, CommitError, TickOutcome};
use super::config::{BatchConfig, RetryPolicy};
use super::item::{Contribution, GroupItem, KeyedGroupItem};
use super::keyed::KeyedAggregator;
use super::map::MapAggregator;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

/// Aggregation strategy under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstStrategy {
    /// Grouped-append: every event must be accounted for
    Map,
    /// Deduplicating: the last write of every key must be accounted for
    Keyed,
}

/// Configuration for a batcher DST run
#[derive(Debug, Clone)]
pub struct BatcherDstConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub strategy: DstStrategy,
    /// Size threshold of the batcher under test
    pub max_size: usize,
    /// Commit attempts per tick
    pub max_attempts: u32,
    /// Probability that one commit attempt fails
    pub commit_failure_prob: f64,
    /// Probability of a tick (vs an add)
    pub tick_probability: f64,
    pub groups: u32,
    pub users_per_group: u32,
}

impl Default for BatcherDstConfig {
    fn default() -> Self {
        BatcherDstConfig {
            seed: 0,
            strategy: DstStrategy::Map,
            max_size: 32,
            max_attempts: 3,
            commit_failure_prob: 0.1,
            tick_probability: 0.05,
            groups: 8,
            users_per_group: 16,
        }
    }
}

impl BatcherDstConfig {
    pub fn new(seed: u64) -> Self {
        BatcherDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// No commit failures
    pub fn calm(seed: u64) -> Self {
        BatcherDstConfig {
            seed,
            commit_failure_prob: 0.0,
            ..Default::default()
        }
    }

    /// Occasional failures, mostly recovered by retries
    pub fn moderate(seed: u64) -> Self {
        BatcherDstConfig {
            seed,
            commit_failure_prob: 0.2,
            ..Default::default()
        }
    }

    /// Frequent failures; many batches are dropped
    pub fn chaos(seed: u64) -> Self {
        BatcherDstConfig {
            seed,
            commit_failure_prob: 0.6,
            max_attempts: 2,
            tick_probability: 0.1,
            ..Default::default()
        }
    }

    pub fn with_strategy(self, strategy: DstStrategy) -> Self {
        BatcherDstConfig { strategy, ..self }
    }

    fn batch_config(&self) -> BatchConfig {
        BatchConfig::test()
            .with_max_size(self.max_size)
            .with_retry(RetryPolicy::immediate(self.max_attempts))
    }
}

/// Event fed to the batcher under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstEvent {
    /// Unique per run, in add order
    pub seq: u64,
    pub group: u32,
    pub user: u32,
    pub on: bool,
}

impl GroupItem for DstEvent {
    fn group(&self) -> String {
        self.group.to_string()
    }
}

impl KeyedGroupItem for DstEvent {
    fn key(&self) -> String {
        format!("{}:{}", self.group, self.user)
    }

    fn contribution(&self) -> Contribution {
        Contribution::from(self.on)
    }
}

/// Workload operation
#[derive(Debug, Clone)]
pub enum DstOperation {
    Add(DstEvent),
    Tick,
}

/// What the commit callback has seen
#[derive(Debug)]
struct CommitLog {
    rng: ChaCha8Rng,
    failure_prob: f64,
    calls: u64,
    failed_calls: u64,
    /// Seq -> number of successful commits containing it
    committed: AHashMap<u64, u32>,
    /// Seqs that were part of at least one failed attempt
    failed: AHashSet<u64>,
    /// Committed batches that held the same key twice
    duplicate_key_batches: u64,
}

impl CommitLog {
    fn commit(&mut self, batch: &[DstEvent]) -> Result<(), CommitError> {
        self.calls += 1;
        if self.failure_prob > 0.0 && self.rng.gen_bool(self.failure_prob) {
            self.failed_calls += 1;
            self.failed.extend(batch.iter().map(|e| e.seq));
            return Err(CommitError::aborted("injected commit failure"));
        }

        let mut keys = AHashSet::with_capacity(batch.len());
        let mut duplicate = false;
        for event in batch {
            duplicate |= !keys.insert(event.key());
            *self.committed.entry(event.seq).or_insert(0) += 1;
        }
        if duplicate {
            self.duplicate_key_batches += 1;
        }
        Ok(())
    }
}

enum DstBatcher {
    Map(Batcher<DstEvent, MapAggregator<DstEvent>>),
    Keyed(Batcher<DstEvent, KeyedAggregator<DstEvent>>),
}

impl DstBatcher {
    fn add(&self, event: DstEvent) {
        match self {
            DstBatcher::Map(b) => b.add(event),
            DstBatcher::Keyed(b) => b.add(event),
        }
    }

    fn tick(&self) -> TickOutcome {
        match self {
            DstBatcher::Map(b) => b.tick(),
            DstBatcher::Keyed(b) => b.tick(),
        }
    }

    fn pending_items(&self) -> Vec<DstEvent> {
        match self {
            DstBatcher::Map(b) => b.with_pending(|agg| agg.aggregate()),
            DstBatcher::Keyed(b) => b.with_pending(|agg| agg.aggregate()),
        }
    }

    fn pending(&self) -> usize {
        match self {
            DstBatcher::Map(b) => b.pending(),
            DstBatcher::Keyed(b) => b.pending(),
        }
    }

    fn stats(&self) -> BatcherStats {
        match self {
            DstBatcher::Map(b) => b.stats(),
            DstBatcher::Keyed(b) => b.stats(),
        }
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct BatcherDstResult {
    pub seed: u64,
    pub strategy: DstStrategy,
    pub total_operations: u64,
    pub adds: u64,
    pub ticks: u64,
    pub commit_calls: u64,
    pub failed_commit_calls: u64,
    pub committed_items: u64,
    pub dropped_items: u64,
    pub pending_items: u64,
    pub invariant_violations: Vec<String>,
}

impl BatcherDstResult {
    pub fn new(seed: u64, strategy: DstStrategy) -> Self {
        BatcherDstResult {
            seed,
            strategy,
            total_operations: 0,
            adds: 0,
            ticks: 0,
            commit_calls: 0,
            failed_commit_calls: 0,
            committed_items: 0,
            dropped_items: 0,
            pending_items: 0,
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {} ({:?}): {} ops ({} adds, {} ticks), {} commits ({} failed), {} committed, {} dropped, {} pending, {} violations",
            self.seed,
            self.strategy,
            self.total_operations,
            self.adds,
            self.ticks,
            self.commit_calls,
            self.failed_commit_calls,
            self.committed_items,
            self.dropped_items,
            self.pending_items,
            self.invariant_violations.len()
        )
    }
}

/// Main DST harness for one batcher
pub struct BatcherDstHarness {
    config: BatcherDstConfig,
    rng: ChaCha8Rng,
    batcher: DstBatcher,
    log: Arc<Mutex<CommitLog>>,
    next_seq: u64,
    /// Shadow state: every event added, by seq
    added: Vec<DstEvent>,
    /// Shadow state: last seq written per key
    last_write: AHashMap<String, u64>,
    result: BatcherDstResult,
}

impl BatcherDstHarness {
    pub fn new(config: BatcherDstConfig) -> Self {
        let log = Arc::new(Mutex::new(CommitLog {
            // Different seed for the failure stream
            rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1)),
            failure_prob: config.commit_failure_prob,
            calls: 0,
            failed_calls: 0,
            committed: AHashMap::new(),
            failed: AHashSet::new(),
            duplicate_key_batches: 0,
        }));

        let sink = Arc::clone(&log);
        let commit = move |batch: &[DstEvent]| sink.lock().commit(batch);
        let batcher = match config.strategy {
            DstStrategy::Map => DstBatcher::Map(Batcher::new(
                "dst-map",
                MapAggregator::new(),
                config.batch_config(),
                commit,
            )),
            DstStrategy::Keyed => DstBatcher::Keyed(Batcher::new(
                "dst-keyed",
                KeyedAggregator::new(),
                config.batch_config(),
                commit,
            )),
        };

        BatcherDstHarness {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            result: BatcherDstResult::new(config.seed, config.strategy),
            config,
            batcher,
            log,
            next_seq: 0,
            added: Vec::new(),
            last_write: AHashMap::new(),
        }
    }

    /// Generate the next operation
    pub fn next_operation(&mut self) -> DstOperation {
        if self.rng.gen_bool(self.config.tick_probability) {
            return DstOperation::Tick;
        }
        let event = DstEvent {
            seq: self.next_seq,
            group: self.rng.gen_range(0..self.config.groups.max(1)),
            user: self.rng.gen_range(0..self.config.users_per_group.max(1)),
            on: self.rng.gen_bool(0.7),
        };
        self.next_seq += 1;
        DstOperation::Add(event)
    }

    /// Run the workload for a number of operations
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.next_operation();
            self.execute(op);
        }
    }

    pub fn execute(&mut self, op: DstOperation) {
        self.result.total_operations += 1;
        match op {
            DstOperation::Add(event) => {
                self.result.adds += 1;
                self.last_write.insert(event.key(), event.seq);
                self.added.push(event.clone());
                self.batcher.add(event);
            }
            DstOperation::Tick => {
                self.result.ticks += 1;
                self.batcher.tick();
            }
        }
    }

    /// Tick until nothing is pending
    pub fn drain(&mut self) {
        while self.batcher.pending() > 0 {
            self.execute(DstOperation::Tick);
        }
    }

    /// Check the conservation invariant against the shadow state
    pub fn check_invariants(&mut self) {
        let log = self.log.lock();
        let stats = self.batcher.stats();
        let pending = self.batcher.pending_items();
        let mut violations = Vec::new();

        for (seq, times) in &log.committed {
            if *times > 1 {
                violations.push(format!("seq {} committed {} times", seq, times));
            }
        }

        let dropped: AHashSet<u64> = log
            .failed
            .iter()
            .copied()
            .filter(|seq| !log.committed.contains_key(seq))
            .collect();

        let pending_seqs: AHashSet<u64> = pending.iter().map(|e| e.seq).collect();
        if pending_seqs.len() != pending.len() {
            violations.push("pending aggregate holds the same event twice".to_string());
        }
        if pending.len() != self.batcher.pending() {
            violations.push(format!(
                "pending() = {} but aggregate holds {}",
                self.batcher.pending(),
                pending.len()
            ));
        }
        for seq in &pending_seqs {
            if log.committed.contains_key(seq) {
                violations.push(format!("seq {} is both pending and committed", seq));
            }
            if dropped.contains(seq) {
                violations.push(format!("seq {} is both pending and dropped", seq));
            }
        }

        let accounted = |seq: u64| {
            log.committed.contains_key(&seq) || dropped.contains(&seq) || pending_seqs.contains(&seq)
        };
        match self.config.strategy {
            DstStrategy::Map => {
                for event in &self.added {
                    if !accounted(event.seq) {
                        violations.push(format!("seq {} lost", event.seq));
                    }
                }
                let total = log.committed.len() + dropped.len() + pending_seqs.len();
                if total != self.added.len() {
                    violations.push(format!(
                        "committed + dropped + pending = {} but {} events were added",
                        total,
                        self.added.len()
                    ));
                }
            }
            DstStrategy::Keyed => {
                for (key, seq) in &self.last_write {
                    if !accounted(*seq) {
                        violations.push(format!("last write of {} (seq {}) lost", key, seq));
                    }
                }
                if log.duplicate_key_batches > 0 {
                    violations.push(format!(
                        "{} committed batches held a key twice",
                        log.duplicate_key_batches
                    ));
                }
            }
        }

        if stats.items_added != self.added.len() as u64 {
            violations.push(format!(
                "stats.items_added = {} but {} events were added",
                stats.items_added,
                self.added.len()
            ));
        }
        if stats.committed_items != log.committed.len() as u64 {
            violations.push(format!(
                "stats.committed_items = {} but callback committed {}",
                stats.committed_items,
                log.committed.len()
            ));
        }
        if stats.dropped_items != dropped.len() as u64 {
            violations.push(format!(
                "stats.dropped_items = {} but {} events were dropped",
                stats.dropped_items,
                dropped.len()
            ));
        }
        if stats.failed_attempts != log.failed_calls {
            violations.push(format!(
                "stats.failed_attempts = {} but callback failed {} times",
                stats.failed_attempts, log.failed_calls
            ));
        }
        let max_calls = stats.flushes * u64::from(self.config.max_attempts.max(1));
        if log.calls > max_calls {
            violations.push(format!(
                "{} commit calls exceed {} flushes x {} attempts",
                log.calls, stats.flushes, self.config.max_attempts
            ));
        }

        self.result.commit_calls = log.calls;
        self.result.failed_commit_calls = log.failed_calls;
        self.result.committed_items = log.committed.len() as u64;
        self.result.dropped_items = dropped.len() as u64;
        self.result.pending_items = pending.len() as u64;
        self.result.invariant_violations.extend(violations);
    }

    pub fn result(&self) -> &BatcherDstResult {
        &self.result
    }

    pub fn into_result(self) -> BatcherDstResult {
        self.result
    }
}

/// Run a batch of DST runs with consecutive seeds
pub fn run_dst_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> BatcherDstConfig,
) -> Vec<BatcherDstResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let config = config_fn(base_seed + i as u64);
        let mut harness = BatcherDstHarness::new(config);
        harness.run(ops_per_run);
        harness.check_invariants();
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[BatcherDstResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let committed: u64 = results.iter().map(|r| r.committed_items).sum();
    let dropped: u64 = results.iter().map(|r| r.dropped_items).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} committed, {} dropped",
        passed, total, total_ops, committed, dropped
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_harness_calm() {
        let mut harness = BatcherDstHarness::new(BatcherDstConfig::calm(42));
        harness.run(300);
        harness.check_invariants();

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.dropped_items, 0);
        assert_eq!(result.failed_commit_calls, 0);
    }

    #[test]
    fn test_dst_harness_chaos_drops_but_conserves() {
        let mut harness = BatcherDstHarness::new(BatcherDstConfig::chaos(7));
        harness.run(500);
        harness.drain();
        harness.check_invariants();

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.pending_items, 0);
        assert!(result.failed_commit_calls > 0);
    }

    #[test]
    fn test_dst_keyed_strategy() {
        let config = BatcherDstConfig::moderate(99).with_strategy(DstStrategy::Keyed);
        let mut harness = BatcherDstHarness::new(config);
        harness.run(400);
        harness.check_invariants();

        assert!(harness.result().is_success(), "{}", harness.result().summary());
    }

    #[test]
    fn test_dst_deterministic() {
        let run = |seed| {
            let mut harness = BatcherDstHarness::new(BatcherDstConfig::moderate(seed));
            harness.run(200);
            harness.check_invariants();
            harness.into_result()
        };

        let first = run(12345);
        let second = run(12345);
        assert_eq!(first.commit_calls, second.commit_calls);
        assert_eq!(first.committed_items, second.committed_items);
        assert_eq!(first.dropped_items, second.dropped_items);
    }

    #[test]
    fn test_workload_generator_mix() {
        let mut harness = BatcherDstHarness::new(BatcherDstConfig::new(1));
        let mut adds = 0;
        let mut ticks = 0;
        for _ in 0..1000 {
            match harness.next_operation() {
                DstOperation::Add(_) => adds += 1,
                DstOperation::Tick => ticks += 1,
            }
        }
        assert!(adds > ticks);
        assert!(ticks > 0);
    }
}
