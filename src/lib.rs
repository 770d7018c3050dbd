//! Write-behind batch aggregation for high-frequency counters.
//!
//! - [`batch`]: generic batchers, aggregation strategies, ticker and DST harness
//! - [`analytics`]: image view/like counters built on two batchers
//! - [`config`]: TOML + environment configuration

pub mod analytics;
pub mod batch;
pub mod config;

pub use analytics::{
    AnalyticsError, AnalyticsStore, ImageAnalytics, ImageId, InMemoryAnalyticsStore,
    SqliteAnalyticsStore, UserId,
};
pub use batch::{
    Aggregator, BatchConfig, Batcher, CommitError, InlineAggregator, KeyedAggregator,
    MapAggregator, RetryPolicy, TickOutcome, TickerHandle,
};
pub use config::{AnalyticsConfig, ConfigError};
