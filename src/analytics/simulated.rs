//! Simulated Analytics Store with Fault Injection
//!
//! DST-compatible wrapper around any [`AnalyticsStore`]. Transactions can
//! fail before the body runs (begin failure) or after it succeeded (commit
//! failure); either way nothing reaches the inner store. Faults are drawn
//! from a seeded ChaCha RNG, so a run is reproducible from its seed.

use super::items::{ImageCounters, ImageId, ImageStates, UserId};
use super::store::{AnalyticsStore, AnalyticsTx, StoreError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability that a transaction fails before its body runs
    pub begin_fail_prob: f64,
    /// Probability that a successful body fails to commit
    pub commit_fail_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            begin_fail_prob: 0.02,
            commit_fail_prob: 0.05,
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            begin_fail_prob: 0.1,
            commit_fail_prob: 0.3,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            begin_fail_prob: 0.0,
            commit_fail_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub transactions: u64,
    pub begin_failures: u64,
    pub commit_failures: u64,
    /// Failures forced through [`SimulatedAnalyticsStore::fail_next`]
    pub forced_failures: u64,
    pub committed: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    forced_failures: u32,
    stats: SimulatedStoreStats,
}

impl SimulatedStoreInner {
    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }
}

enum Fault {
    Forced,
    Begin,
}

/// Store wrapper that injects transaction faults
pub struct SimulatedAnalyticsStore<S> {
    inner: S,
    config: SimulatedStoreConfig,
    state: Mutex<SimulatedStoreInner>,
}

impl<S: AnalyticsStore> SimulatedAnalyticsStore<S> {
    pub fn new(inner: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedAnalyticsStore {
            inner,
            config,
            state: Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                forced_failures: 0,
                stats: SimulatedStoreStats::default(),
            }),
        }
    }

    /// Fail the next `count` transactions regardless of probabilities
    pub fn fail_next(&self, count: u32) {
        self.state.lock().forced_failures = count;
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    fn begin_fault(&self) -> Option<Fault> {
        let mut s = self.state.lock();
        s.stats.transactions += 1;
        if s.forced_failures > 0 {
            s.forced_failures -= 1;
            s.stats.forced_failures += 1;
            return Some(Fault::Forced);
        }
        if s.roll(self.config.begin_fail_prob) {
            s.stats.begin_failures += 1;
            return Some(Fault::Begin);
        }
        None
    }
}

impl<S: AnalyticsStore> AnalyticsStore for SimulatedAnalyticsStore<S> {
    fn register_image(&self, image_id: ImageId) -> Result<(), StoreError> {
        self.inner.register_image(image_id)
    }

    fn image_counters(&self, image_id: ImageId) -> Result<Option<ImageCounters>, StoreError> {
        self.inner.image_counters(image_id)
    }

    fn viewer_state(&self, image_id: ImageId, user_id: UserId) -> Result<ImageStates, StoreError> {
        self.inner.viewer_state(image_id, user_id)
    }

    fn has_like(&self, image_id: ImageId, user_id: UserId) -> Result<bool, StoreError> {
        self.inner.has_like(image_id, user_id)
    }

    fn transaction<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn AnalyticsTx) -> Result<R, StoreError>,
    {
        match self.begin_fault() {
            Some(Fault::Forced) => {
                return Err(StoreError::Injected("forced transaction failure".to_string()))
            }
            Some(Fault::Begin) => {
                return Err(StoreError::Injected("simulated begin failure".to_string()))
            }
            None => {}
        }

        let commit_prob = self.config.commit_fail_prob;
        let state = &self.state;
        let result = self.inner.transaction(|tx| {
            let value = f(tx)?;
            // Failing here makes the inner store roll back the body.
            let mut s = state.lock();
            if s.roll(commit_prob) {
                s.stats.commit_failures += 1;
                return Err(StoreError::Injected("simulated commit failure".to_string()));
            }
            Ok(value)
        })?;

        self.state.lock().stats.committed += 1;
        Ok(result)
    }
}
