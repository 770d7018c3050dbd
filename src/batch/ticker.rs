//! Ticker - Periodic Flush Loop
//!
//! One tokio task per batcher. The task sleeps for the flush interval, then
//! runs [`Batcher::tick`] on the blocking pool so a slow commit never stalls
//! the runtime's worker threads.
//!
//! ```text
//! interval ──► spawn_blocking(tick) ──► interval ──► ...
//!                                          │
//! TickerHandle::shutdown ──────────────────┴──► final tick ──► exit
//! ```
//!
//! Missed ticks are delayed rather than bursted: a commit that outlasts the
//! interval pushes the next tick back instead of queueing catch-up flushes.

use super::aggregator::Aggregator;
use super::batcher::{Batcher, TickOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

enum TickerMessage {
    /// Final drain, then exit
    Shutdown {
        response_tx: oneshot::Sender<Option<TickOutcome>>,
    },
}

struct Ticker<T, A> {
    batcher: Arc<Batcher<T, A>>,
    period: Duration,
    rx: mpsc::UnboundedReceiver<TickerMessage>,
}

impl<T, A> Ticker<T, A>
where
    T: Send + 'static,
    A: Aggregator<T> + 'static,
{
    async fn run(mut self) {
        let mut ticks = interval_at(Instant::now() + self.period, self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.tick_blocking().await;
                }
                msg = self.rx.recv() => {
                    let outcome = self.tick_blocking().await;
                    info!(batcher = %self.batcher.name(), ?outcome, "ticker shutting down");
                    if let Some(TickerMessage::Shutdown { response_tx }) = msg {
                        let _ = response_tx.send(outcome);
                    }
                    break;
                }
            }
        }
    }

    /// `None` when the tick panicked (a panicking commit callback).
    async fn tick_blocking(&self) -> Option<TickOutcome> {
        let batcher = Arc::clone(&self.batcher);
        match tokio::task::spawn_blocking(move || batcher.tick()).await {
            Ok(outcome) => {
                if outcome != TickOutcome::Empty {
                    debug!(batcher = %self.batcher.name(), ?outcome, "periodic tick");
                }
                Some(outcome)
            }
            Err(e) => {
                error!(batcher = %self.batcher.name(), error = %e, "tick task failed");
                None
            }
        }
    }
}

/// Handle to a running ticker.
///
/// Dropping the handle stops the ticker too (after one final tick), but
/// only `shutdown` lets the caller wait for that last flush.
pub struct TickerHandle {
    tx: mpsc::UnboundedSender<TickerMessage>,
    task: tokio::task::JoinHandle<()>,
}

impl TickerHandle {
    /// Stop the loop after one final draining tick.
    ///
    /// Resolves once that tick has finished. Returns its outcome, or `None`
    /// if the ticker had already stopped.
    pub async fn shutdown(self) -> Option<TickOutcome> {
        let (response_tx, response_rx) = oneshot::channel();
        let outcome = if self.tx.send(TickerMessage::Shutdown { response_tx }).is_ok() {
            response_rx.await.ok().flatten()
        } else {
            None
        };
        let _ = self.task.await;
        outcome
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the periodic flush loop for `batcher`.
///
/// Must be called from within a tokio runtime. A zero `period` is raised
/// to one millisecond.
pub fn spawn_ticker<T, A>(batcher: Arc<Batcher<T, A>>, period: Duration) -> TickerHandle
where
    T: Send + 'static,
    A: Aggregator<T> + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let ticker = Ticker {
        batcher,
        period: period.max(MIN_INTERVAL),
        rx,
    };
    let task = tokio::spawn(ticker.run());
    TickerHandle { tx, task }
}

impl<T, A> Batcher<T, A>
where
    T: Send + 'static,
    A: Aggregator<T> + 'static,
{
    /// Spawn a ticker flushing this batcher every `period`.
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> TickerHandle {
        spawn_ticker(Arc::clone(self), period)
    }
}
