//! Write-behind analytics load driver
//!
//! Runs concurrent simulated viewers against an [`ImageAnalytics`] for a
//! fixed time or until ctrl-c, stops the writers, drains the batchers and
//! reports the committed counters.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | TALLY_CONFIG | - | Path to a TOML configuration file |
//! | TALLY_RUN_SECS | 10 | How long the writers run |
//! | TALLY_WRITERS | 4 | Concurrent writer tasks |
//! | TALLY_IMAGES | 32 | Images registered up front |
//! | TALLY_USERS | 1000 | Distinct simulated users |
//! | TALLY_LOG_JSON | false | JSON log output |
//! | RUST_LOG | info | Log filter |
//!
//! Every `TALLY_*` override documented in `tally_batch::config` applies on
//! top of the file.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use futures::future::join_all;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_batch::analytics::{
    AnalyticsStore, ImageAnalytics, ImageCounters, ImageId, InMemoryAnalyticsStore,
    SqliteAnalyticsStore, UserId,
};
use tally_batch::config::{AnalyticsConfig, ConfigError, StoreBackend};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
struct DriverConfig {
    run_for: Duration,
    writers: usize,
    images: i64,
    users: i64,
}

impl DriverConfig {
    fn from_env() -> Self {
        DriverConfig {
            run_for: Duration::from_secs(env_or("TALLY_RUN_SECS", 10)),
            writers: env_or("TALLY_WRITERS", 4),
            images: env_or("TALLY_IMAGES", 32).max(1),
            users: env_or("TALLY_USERS", 1000).max(1),
        }
    }
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TALLY_LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> Result<AnalyticsConfig, ConfigError> {
    let mut config = match std::env::var("TALLY_CONFIG") {
        Ok(path) => AnalyticsConfig::from_file(path)?,
        Err(_) => AnalyticsConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Default)]
struct WriterCounts {
    views: AtomicU64,
    likes: AtomicU64,
    unlikes: AtomicU64,
}

/// Outcome of one driver run, read after the batchers were drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RunReport {
    views: u64,
    likes: u64,
    unlikes: u64,
    committed: ImageCounters,
}

async fn run<S: AnalyticsStore>(
    store: S,
    config: AnalyticsConfig,
    driver: DriverConfig,
) -> Result<(), BoxError> {
    let analytics = Arc::new(ImageAnalytics::new(store, &config));
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("shutdown signal received, stopping writers"),
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c, running to completion");
                std::future::pending::<()>().await;
            }
        }
    };
    let report = drive(Arc::clone(&analytics), &driver, ctrl_c).await?;

    info!(
        views = report.views,
        likes = report.likes,
        unlikes = report.unlikes,
        "events emitted"
    );
    info!(stats = %serde_json::to_string(&analytics.views().stats())?, "view batcher");
    info!(stats = %serde_json::to_string(&analytics.likes().stats())?, "like batcher");
    info!(
        total_views = report.committed.views,
        total_likes = report.committed.likes,
        "final committed counters"
    );
    Ok(())
}

/// Run the writers until `run_for` elapses or `shutdown` resolves.
///
/// Writers are stopped and awaited before the tickers drain, so no event
/// lands after the final flush. Totals come from the store alone.
async fn drive<S, F>(
    analytics: Arc<ImageAnalytics<S>>,
    driver: &DriverConfig,
    shutdown: F,
) -> Result<RunReport, BoxError>
where
    S: AnalyticsStore,
    F: Future<Output = ()>,
{
    for id in 0..driver.images {
        analytics.register_image(ImageId(id))?;
    }
    let tickers = analytics.spawn_tickers();
    let counts = Arc::new(WriterCounts::default());
    let (stop_tx, stop_rx) = watch::channel(false);

    info!(
        writers = driver.writers,
        images = driver.images,
        users = driver.users,
        run_secs = driver.run_for.as_secs(),
        "starting writers"
    );

    let mut writers = Vec::with_capacity(driver.writers);
    for writer in 0..driver.writers {
        let analytics = Arc::clone(&analytics);
        let counts = Arc::clone(&counts);
        let driver = driver.clone();
        let stop = stop_rx.clone();
        writers.push(tokio::spawn(async move {
            let mut rng = ChaCha8Rng::seed_from_u64(writer as u64);
            let deadline = tokio::time::Instant::now() + driver.run_for;
            while !*stop.borrow() && tokio::time::Instant::now() < deadline {
                let image = ImageId(rng.gen_range(0..driver.images));
                let user = UserId(rng.gen_range(0..driver.users));
                // add() may flush inline; keep that off the async workers
                let analytics = Arc::clone(&analytics);
                let roll = rng.gen_range(0..100);
                let anonymous = rng.gen_bool(0.3);
                let joined = tokio::task::spawn_blocking(move || match roll {
                    0..=69 => analytics.add_view(image, (!anonymous).then_some(user)),
                    70..=89 => analytics.add_like(image, user),
                    _ => analytics.remove_like(image, user),
                })
                .await;
                if joined.is_err() {
                    break;
                }
                match roll {
                    0..=69 => counts.views.fetch_add(1, Ordering::Relaxed),
                    70..=89 => counts.likes.fetch_add(1, Ordering::Relaxed),
                    _ => counts.unlikes.fetch_add(1, Ordering::Relaxed),
                };
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
        }));
    }

    let writers = join_all(writers);
    tokio::pin!(writers);
    tokio::select! {
        _ = &mut writers => {}
        _ = shutdown => {
            let _ = stop_tx.send(true);
            writers.as_mut().await;
        }
    }

    tickers.shutdown().await;

    let mut committed = ImageCounters::default();
    for id in 0..driver.images {
        if let Some(row) = analytics.store().image_counters(ImageId(id))? {
            committed.views += row.views;
            committed.likes += row.likes;
        }
    }

    Ok(RunReport {
        views: counts.views.load(Ordering::Relaxed),
        likes: counts.likes.load(Ordering::Relaxed),
        unlikes: counts.unlikes.load(Ordering::Relaxed),
        committed,
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let config = load_config()?;
    let driver = DriverConfig::from_env();
    info!(backend = ?config.store.backend, "tally-batch load driver");

    match config.store.backend {
        StoreBackend::InMemory => run(InMemoryAnalyticsStore::new(), config, driver).await,
        StoreBackend::Sqlite => {
            let path = config
                .store
                .sqlite_path
                .clone()
                .ok_or("store.sqlite_path is required for the sqlite backend")?;
            let store = SqliteAnalyticsStore::open(path, config.store.commit_timeout)?;
            run(store, config, driver).await
        }
    }
}
