//! Batcher DST Tests
//!
//! Seed-based simulation of one batcher under injected commit failures.
//! Each run checks that every added event is committed at most once and
//! is otherwise either dropped after exhausting its retries or still
//! pending.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, nothing is ever dropped
//! - **Moderate tests**: Some faults, retries absorb most of them
//! - **Chaos tests**: Many faults and few attempts, drops are expected

use tally_batch::batch::{
    run_dst_batch, summarize_batch, BatcherDstConfig, BatcherDstHarness, BatcherDstResult,
    DstStrategy,
};

fn failed_seeds(results: &[BatcherDstResult]) -> Vec<u64> {
    results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect()
}

// =============================================================================
// Single Seed Tests
// =============================================================================

#[test]
fn test_batcher_dst_single_calm() {
    let mut harness = BatcherDstHarness::new(BatcherDstConfig::calm(12345));

    harness.run(500);
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.total_operations, 500);
    assert_eq!(result.dropped_items, 0);
}

#[test]
fn test_batcher_dst_single_moderate() {
    let mut harness = BatcherDstHarness::new(BatcherDstConfig::moderate(54321));

    harness.run(500);
    harness.drain();
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert_eq!(result.pending_items, 0);
}

#[test]
fn test_batcher_dst_single_chaos() {
    let mut harness = BatcherDstHarness::new(BatcherDstConfig::chaos(99999));

    harness.run(500);
    harness.drain();
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.failed_commit_calls > 0, "chaos should inject failures");
}

#[test]
fn test_batcher_dst_single_keyed_chaos() {
    let config = BatcherDstConfig::chaos(31337).with_strategy(DstStrategy::Keyed);
    let mut harness = BatcherDstHarness::new(config);

    harness.run(500);
    harness.drain();
    harness.check_invariants();

    let result = harness.result();
    println!("{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
}

// =============================================================================
// Multi-Seed Batch Tests (DST)
// =============================================================================

#[test]
fn test_batcher_dst_100_seeds_calm() {
    let results = run_dst_batch(0, 100, 200, BatcherDstConfig::calm);

    let summary = summarize_batch(&results);
    println!("100 Seeds Calm:\n{}", summary);

    assert!(
        failed_seeds(&results).is_empty(),
        "All calm runs should pass. Failed seeds: {:?}",
        failed_seeds(&results)
    );
    assert!(results.iter().all(|r| r.dropped_items == 0));
}

#[test]
fn test_batcher_dst_100_seeds_moderate() {
    let results = run_dst_batch(1000, 100, 200, BatcherDstConfig::moderate);

    println!("100 Seeds Moderate:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
}

#[test]
fn test_batcher_dst_100_seeds_chaos() {
    let results = run_dst_batch(2000, 100, 200, BatcherDstConfig::chaos);

    println!("100 Seeds Chaos:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
    let dropped: u64 = results.iter().map(|r| r.dropped_items).sum();
    assert!(dropped > 0, "chaos over 100 seeds should drop something");
}

#[test]
fn test_batcher_dst_100_seeds_keyed_chaos() {
    let results = run_dst_batch(3000, 100, 200, |seed| {
        BatcherDstConfig::chaos(seed).with_strategy(DstStrategy::Keyed)
    });

    println!("100 Seeds Keyed Chaos:\n{}", summarize_batch(&results));

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
}

// =============================================================================
// Stress Tests (longer runs)
// =============================================================================

#[test]
fn test_batcher_dst_stress_small_batches() {
    let mut config = BatcherDstConfig::moderate(7777);
    config.max_size = 2;
    config.tick_probability = 0.0;

    let mut harness = BatcherDstHarness::new(config);
    harness.run(2000);
    assert_eq!(harness.result().ticks, 0, "every flush was size-triggered");

    harness.drain();
    harness.check_invariants();

    let result = harness.result();
    println!("Stress small batches:\n{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.commit_calls >= 1000);
}

// =============================================================================
// Determinism Verification
// =============================================================================

#[test]
fn test_batcher_dst_determinism() {
    fn run_seed(seed: u64) -> (u64, u64, u64, u64) {
        let mut harness = BatcherDstHarness::new(BatcherDstConfig::chaos(seed));
        harness.run(300);
        harness.check_invariants();
        let result = harness.result();
        (
            result.commit_calls,
            result.failed_commit_calls,
            result.committed_items,
            result.dropped_items,
        )
    }

    let seed = 42424242;
    let run1 = run_seed(seed);
    let run2 = run_seed(seed);

    assert_eq!(
        run1, run2,
        "Same seed should produce identical results: {:?} vs {:?}",
        run1, run2
    );
}
