//! Write-Behind Batch Aggregation
//!
//! Coalesces high-frequency, low-value events into periodic bulk commits
//! while still answering reads about the not-yet-committed state.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Batcher::add ──► Aggregator (Inline | Map | Keyed)
//!                │                    │
//!                │ size threshold     │ drain
//!                ▼                    ▼
//!           Batcher::tick ──► commit callback ──► durable store
//!                ▲
//!            Ticker (tokio, every flush_interval)
//! ```
//!
//! ## Aggregation strategies
//!
//! | Strategy           | `add`               | `count_by_group`         | Lookup   |
//! |--------------------|---------------------|--------------------------|----------|
//! | `InlineAggregator` | append              | raw items in group       | scan     |
//! | `MapAggregator`    | append to group     | raw items in group       | scan     |
//! | `KeyedAggregator`  | upsert by key       | distinct keys touched    | exact    |

pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod dst;
pub mod inline;
pub mod item;
pub mod keyed;
pub mod map;
pub mod ticker;

pub use aggregator::{Aggregator, ExactLookup, ScanLookup};
pub use batcher::{Batcher, BatcherStats, CommitError, CommitFn, TickOutcome};
pub use config::{BatchConfig, RetryPolicy};
pub use dst::{
    run_dst_batch, summarize_batch, BatcherDstConfig, BatcherDstHarness, BatcherDstResult,
    DstStrategy,
};
pub use inline::InlineAggregator;
pub use item::{Contribution, GroupItem, KeyedGroupItem};
pub use keyed::KeyedAggregator;
pub use map::MapAggregator;
pub use ticker::{spawn_ticker, TickerHandle};
