//! Image Analytics
//!
//! View and like counters for images, buffered through write-behind
//! batchers and committed to an [`AnalyticsStore`] in bulk.
//!
//! ```text
//! add_view / add_like ──► ViewBatcher / LikeBatcher ──► AnalyticsStore::transaction
//!                               │                              │
//! states / has_like / get_detailed ◄── pending ⊕ committed ────┘
//! ```

pub mod items;
pub mod repository;
pub mod simulated;
pub mod sqlite;
pub mod store;

pub use items::{
    image_user_key, CounterDelta, GroupDelta, ImageCounters, ImageId, ImageStates, ImageStats,
    LikeItem, UserId, ViewItem, ANONYMOUS_TOKEN_LEN,
};
pub use repository::{
    AnalyticsError, AnalyticsTickers, FlushOutcome, ImageAnalytics, LikeBatcher, ViewBatcher,
};
pub use simulated::{SimulatedAnalyticsStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use sqlite::SqliteAnalyticsStore;
pub use store::{AnalyticsStore, AnalyticsTx, InMemoryAnalyticsStore, StoreError};
