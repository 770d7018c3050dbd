//! Analytics Store Abstraction
//!
//! The durable side of image analytics: counter rows plus the per-viewer
//! view and like facts that back them. Batch commits go through
//! [`AnalyticsStore::transaction`], which is all or nothing.
//!
//! ## Implementations
//!
//! - [`InMemoryAnalyticsStore`]: in-process state, for tests and the demo binary
//! - [`SqliteAnalyticsStore`](crate::analytics::SqliteAnalyticsStore): embedded SQLite
//! - [`SimulatedAnalyticsStore`](crate::analytics::SimulatedAnalyticsStore):
//!   fault-injecting wrapper for simulation tests

use super::items::{
    tally, CounterDelta, GroupDelta, ImageCounters, ImageId, ImageStates, LikeItem, UserId,
    ViewItem,
};
use crate::batch::CommitError;
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("injected fault: {0}")]
    Injected(String),
    #[error("transaction took {elapsed:?}, limit is {limit:?}")]
    Timeout { elapsed: Duration, limit: Duration },
}

impl From<StoreError> for CommitError {
    fn from(e: StoreError) -> Self {
        CommitError::failed(e)
    }
}

/// Bulk writes available inside one store transaction
pub trait AnalyticsTx {
    /// Insert view facts, skipping ones already recorded. Anonymous views
    /// never conflict. Returns the rows actually inserted per image.
    fn insert_views(&mut self, views: &[ViewItem]) -> Result<Vec<GroupDelta>, StoreError>;

    /// Insert like facts, skipping ones already recorded. Returns the rows
    /// actually inserted per image.
    fn insert_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError>;

    /// Delete like facts. Returns the rows actually deleted per image.
    fn delete_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError>;

    /// Add signed deltas to existing counter rows. Unknown images are
    /// skipped. Returns the number of rows updated.
    fn apply_counter_deltas(&mut self, deltas: &[CounterDelta]) -> Result<usize, StoreError>;
}

/// Durable analytics storage
pub trait AnalyticsStore: Send + Sync + 'static {
    /// Create a zeroed counter row for `image_id` if it has none
    fn register_image(&self, image_id: ImageId) -> Result<(), StoreError>;

    fn image_counters(&self, image_id: ImageId) -> Result<Option<ImageCounters>, StoreError>;

    fn viewer_state(&self, image_id: ImageId, user_id: UserId) -> Result<ImageStates, StoreError>;

    fn has_like(&self, image_id: ImageId, user_id: UserId) -> Result<bool, StoreError>;

    /// Run `f` in one transaction: committed when `f` returns `Ok`, rolled
    /// back otherwise.
    fn transaction<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn AnalyticsTx) -> Result<R, StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct AnalyticsState {
    counters: AHashMap<ImageId, ImageCounters>,
    views: AHashSet<(ImageId, UserId)>,
    anonymous_views: AHashMap<ImageId, u64>,
    likes: AHashSet<(ImageId, UserId)>,
}

/// In-memory analytics store.
///
/// Transactions run one at a time. Their writes are staged next to the live
/// state and merged into it only when the transaction succeeds, so the cost
/// of a commit follows the size of the batch, not the recorded history.
#[derive(Debug, Default)]
pub struct InMemoryAnalyticsStore {
    state: RwLock<AnalyticsState>,
    tx_lock: Mutex<()>,
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anonymous views recorded for `image_id`
    pub fn anonymous_views(&self, image_id: ImageId) -> u64 {
        self.state
            .read()
            .anonymous_views
            .get(&image_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Writes of one open transaction. `liked` and `unliked` never share a key.
#[derive(Debug, Default)]
struct StagedWrites {
    views: AHashSet<(ImageId, UserId)>,
    anonymous_views: AHashMap<ImageId, u64>,
    liked: AHashSet<(ImageId, UserId)>,
    unliked: AHashSet<(ImageId, UserId)>,
    counters: AHashMap<ImageId, ImageCounters>,
}

impl StagedWrites {
    fn apply(self, state: &mut AnalyticsState) {
        state.views.extend(self.views);
        for (image_id, count) in self.anonymous_views {
            *state.anonymous_views.entry(image_id).or_insert(0) += count;
        }
        for key in &self.unliked {
            state.likes.remove(key);
        }
        state.likes.extend(self.liked);
        state.counters.extend(self.counters);
    }
}

struct InMemoryTx<'a> {
    base: &'a AnalyticsState,
    staged: &'a mut StagedWrites,
}

impl InMemoryTx<'_> {
    fn has_like(&self, key: &(ImageId, UserId)) -> bool {
        self.staged.liked.contains(key)
            || (self.base.likes.contains(key) && !self.staged.unliked.contains(key))
    }
}

impl AnalyticsTx for InMemoryTx<'_> {
    fn insert_views(&mut self, views: &[ViewItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut inserted = Vec::with_capacity(views.len());
        for view in views {
            match view.user_id {
                Some(user_id) => {
                    let key = (view.image_id, user_id);
                    if !self.base.views.contains(&key) && self.staged.views.insert(key) {
                        inserted.push(view.image_id);
                    }
                }
                None => {
                    *self.staged.anonymous_views.entry(view.image_id).or_insert(0) += 1;
                    inserted.push(view.image_id);
                }
            }
        }
        Ok(tally(inserted))
    }

    fn insert_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut inserted = Vec::with_capacity(likes.len());
        for like in likes {
            let key = (like.image_id, like.user_id);
            if self.has_like(&key) {
                continue;
            }
            if !self.staged.unliked.remove(&key) {
                self.staged.liked.insert(key);
            }
            inserted.push(like.image_id);
        }
        Ok(tally(inserted))
    }

    fn delete_likes(&mut self, likes: &[LikeItem]) -> Result<Vec<GroupDelta>, StoreError> {
        let mut removed = Vec::with_capacity(likes.len());
        for like in likes {
            let key = (like.image_id, like.user_id);
            if !self.has_like(&key) {
                continue;
            }
            if !self.staged.liked.remove(&key) {
                self.staged.unliked.insert(key);
            }
            removed.push(like.image_id);
        }
        Ok(tally(removed))
    }

    fn apply_counter_deltas(&mut self, deltas: &[CounterDelta]) -> Result<usize, StoreError> {
        let mut updated = 0;
        for delta in deltas {
            let current = self
                .staged
                .counters
                .get(&delta.image_id)
                .or_else(|| self.base.counters.get(&delta.image_id))
                .copied();
            if let Some(row) = current {
                self.staged.counters.insert(
                    delta.image_id,
                    ImageCounters {
                        views: row.views + delta.views,
                        likes: row.likes + delta.likes,
                    },
                );
                updated += 1;
            }
        }
        Ok(updated)
    }
}

impl AnalyticsStore for InMemoryAnalyticsStore {
    fn register_image(&self, image_id: ImageId) -> Result<(), StoreError> {
        let _tx = self.tx_lock.lock();
        self.state.write().counters.entry(image_id).or_default();
        Ok(())
    }

    fn image_counters(&self, image_id: ImageId) -> Result<Option<ImageCounters>, StoreError> {
        Ok(self.state.read().counters.get(&image_id).copied())
    }

    fn viewer_state(&self, image_id: ImageId, user_id: UserId) -> Result<ImageStates, StoreError> {
        let state = self.state.read();
        Ok(ImageStates {
            viewed: state.views.contains(&(image_id, user_id)),
            liked: state.likes.contains(&(image_id, user_id)),
        })
    }

    fn has_like(&self, image_id: ImageId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.state.read().likes.contains(&(image_id, user_id)))
    }

    fn transaction<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn AnalyticsTx) -> Result<R, StoreError>,
    {
        let _tx = self.tx_lock.lock();
        let mut staged = StagedWrites::default();
        let result = {
            let base = self.state.read();
            f(&mut InMemoryTx {
                base: &base,
                staged: &mut staged,
            })?
        };
        staged.apply(&mut self.state.write());
        Ok(result)
    }
}
