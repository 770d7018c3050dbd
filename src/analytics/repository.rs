//! Image analytics with write-behind counters.
//!
//! Likes and views are buffered in two deduplicating batchers and committed
//! to the store in bulk. Reads merge the committed state with whatever is
//! still pending, so a viewer sees their own like before it is flushed.
//!
//! ## Commit shape (one store transaction per flush)
//!
//! ```text
//! views: insert_views ──► per-image inserted ──► views_count += inserted
//! likes: partition by final state
//!          liked   ──► insert_likes ──► +inserted ─┐
//!          unliked ──► delete_likes ──► -removed  ─┴► likes_count += net
//! ```
//!
//! Counter deltas are derived from rows actually written, so a repeated view
//! by the same user or a like that already exists does not inflate counts.

use super::items::{
    image_user_key, CounterDelta, GroupDelta, ImageId, ImageStates, ImageStats, LikeItem, UserId,
    ViewItem,
};
use super::store::{AnalyticsStore, StoreError};
use crate::batch::{
    Batcher, CommitError, KeyedAggregator, KeyedGroupItem, TickOutcome, TickerHandle,
};
use crate::config::AnalyticsConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type LikeBatcher = Batcher<LikeItem, KeyedAggregator<LikeItem>>;
pub type ViewBatcher = Batcher<ViewItem, KeyedAggregator<ViewItem>>;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("image {0} not found")]
    NotFound(ImageId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of flushing both batchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub likes: TickOutcome,
    pub views: TickOutcome,
}

/// Running tickers of one [`ImageAnalytics`]
pub struct AnalyticsTickers {
    likes: TickerHandle,
    views: TickerHandle,
}

impl AnalyticsTickers {
    /// Stop both tickers; each drains its batcher once more before exiting.
    pub async fn shutdown(self) {
        let (likes, views) = tokio::join!(self.likes.shutdown(), self.views.shutdown());
        info!(?likes, ?views, "analytics tickers stopped");
    }
}

pub struct ImageAnalytics<S> {
    store: Arc<S>,
    likes: Arc<LikeBatcher>,
    views: Arc<ViewBatcher>,
    config: AnalyticsConfig,
}

impl<S: AnalyticsStore> ImageAnalytics<S> {
    pub fn new(store: S, config: &AnalyticsConfig) -> Self {
        let store = Arc::new(store);
        let commit_timeout = config.store.commit_timeout;

        let views = {
            let store = Arc::clone(&store);
            Batcher::new(
                "image-views",
                KeyedAggregator::new(),
                config.views.clone(),
                move |batch: &[ViewItem]| commit_views(&*store, batch, commit_timeout),
            )
        };
        let likes = {
            let store = Arc::clone(&store);
            Batcher::new(
                "image-likes",
                KeyedAggregator::new(),
                config.likes.clone(),
                move |batch: &[LikeItem]| commit_likes(&*store, batch, commit_timeout),
            )
        };

        ImageAnalytics {
            store,
            likes: Arc::new(likes),
            views: Arc::new(views),
            config: config.clone(),
        }
    }

    /// Start the periodic flush of both batchers. Requires a tokio runtime.
    pub fn spawn_tickers(&self) -> AnalyticsTickers {
        AnalyticsTickers {
            likes: self.likes.spawn_ticker(self.config.likes.flush_interval),
            views: self.views.spawn_ticker(self.config.views.flush_interval),
        }
    }

    /// Flush both batchers on the calling thread
    pub fn flush(&self) -> FlushOutcome {
        FlushOutcome {
            likes: self.likes.tick(),
            views: self.views.tick(),
        }
    }

    pub fn register_image(&self, image_id: ImageId) -> Result<(), AnalyticsError> {
        self.store.register_image(image_id)?;
        Ok(())
    }

    /// Buffer a like.
    ///
    /// The `add_*` methods return as soon as the event is buffered, except
    /// when it fills the batch to `max_size`: the flush then commits inline
    /// on the calling thread, retry backoff included. Async callers should
    /// go through `spawn_blocking` rather than call these on a runtime
    /// worker.
    pub fn add_like(&self, image_id: ImageId, user_id: UserId) {
        self.likes.add(LikeItem::like(image_id, user_id));
    }

    /// Buffer an unlike. May flush inline; see [`ImageAnalytics::add_like`].
    pub fn remove_like(&self, image_id: ImageId, user_id: UserId) {
        self.likes.add(LikeItem::unlike(image_id, user_id));
    }

    /// Record a view; `None` for an anonymous viewer. May flush inline; see
    /// [`ImageAnalytics::add_like`].
    pub fn add_view(&self, image_id: ImageId, user_id: Option<UserId>) {
        self.views.add(ViewItem::new(image_id, user_id));
    }

    /// Viewer state, with pending events taking precedence over the store
    pub fn states(&self, image_id: ImageId, user_id: UserId) -> Result<ImageStates, AnalyticsError> {
        let mut states = self.store.viewer_state(image_id, user_id)?;
        let key = image_user_key(image_id, user_id);

        if self.views.lookup(&key).is_some() {
            states.viewed = true;
        }
        if let Some(like) = self.likes.lookup(&key) {
            states.liked = like.liked;
        }
        Ok(states)
    }

    pub fn has_like(&self, image_id: ImageId, user_id: UserId) -> Result<bool, AnalyticsError> {
        if let Some(like) = self.likes.lookup(&image_user_key(image_id, user_id)) {
            return Ok(like.liked);
        }
        Ok(self.store.has_like(image_id, user_id)?)
    }

    /// Committed counters plus the pending figures of both batchers.
    ///
    /// The pending like figure counts distinct users who touched their like
    /// since the last flush, unlikes included.
    pub fn get_detailed(&self, image_id: ImageId) -> Result<ImageStats, AnalyticsError> {
        let counters = self
            .store
            .image_counters(image_id)?
            .ok_or(AnalyticsError::NotFound(image_id))?;

        let group = image_id.to_string();
        let pending_views = self.views.count_by_group(&group);
        let pending_likes = self.likes.count_by_group(&group);

        Ok(ImageStats {
            image_id,
            views: counters.views + pending_views as i64,
            likes: counters.likes + pending_likes as i64,
            pending_views,
            pending_likes,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn likes(&self) -> &Arc<LikeBatcher> {
        &self.likes
    }

    pub fn views(&self) -> &Arc<ViewBatcher> {
        &self.views
    }
}

fn commit_views<S: AnalyticsStore>(
    store: &S,
    views: &[ViewItem],
    commit_timeout: Duration,
) -> Result<(), CommitError> {
    let start = Instant::now();
    let rows = store.transaction(|tx| {
        let inserted = tx.insert_views(views)?;
        let deltas = inserted
            .iter()
            .map(|d| CounterDelta {
                image_id: d.image_id,
                views: d.count as i64,
                likes: 0,
            })
            .collect::<Vec<_>>();
        tx.apply_counter_deltas(&deltas)
    })?;

    log_commit("views", views.len(), rows, start, commit_timeout);
    Ok(())
}

fn commit_likes<S: AnalyticsStore>(
    store: &S,
    likes: &[LikeItem],
    commit_timeout: Duration,
) -> Result<(), CommitError> {
    let start = Instant::now();
    let (inserts, deletes): (Vec<LikeItem>, Vec<LikeItem>) = likes
        .iter()
        .cloned()
        .partition(|like| like.contribution().is_increment());

    let rows = store.transaction(|tx| {
        let inserted = if inserts.is_empty() {
            Vec::new()
        } else {
            tx.insert_likes(&inserts)?
        };
        let removed = if deletes.is_empty() {
            Vec::new()
        } else {
            tx.delete_likes(&deletes)?
        };
        tx.apply_counter_deltas(&net_like_deltas(&inserted, &removed))
    })?;

    log_commit("likes", likes.len(), rows, start, commit_timeout);
    Ok(())
}

/// `inserted - removed` per image; images netting to zero are left out
fn net_like_deltas(inserted: &[GroupDelta], removed: &[GroupDelta]) -> Vec<CounterDelta> {
    let mut net: BTreeMap<ImageId, i64> = BTreeMap::new();
    for d in inserted {
        *net.entry(d.image_id).or_insert(0) += d.count as i64;
    }
    for d in removed {
        *net.entry(d.image_id).or_insert(0) -= d.count as i64;
    }
    net.into_iter()
        .filter(|(_, likes)| *likes != 0)
        .map(|(image_id, likes)| CounterDelta {
            image_id,
            views: 0,
            likes,
        })
        .collect()
}

fn log_commit(kind: &str, items: usize, rows: usize, start: Instant, limit: Duration) {
    let elapsed = start.elapsed();
    if elapsed > limit {
        warn!(
            kind,
            items,
            counter_rows = rows,
            elapsed_ms = elapsed.as_millis() as u64,
            limit_ms = limit.as_millis() as u64,
            "slow analytics commit"
        );
    } else {
        debug!(
            kind,
            items,
            counter_rows = rows,
            elapsed_us = elapsed.as_micros() as u64,
            "analytics batch committed"
        );
    }
}
