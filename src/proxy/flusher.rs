//! Periodic response flushing.
//!
//! Streaming producers such as log-follow can stay silent for a long time and
//! then emit a few bytes. Those bytes sit in the response buffer until
//! something flushes it, so while a response body is being copied a
//! background task flushes it at a fixed cadence.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::lifecycle::Scope;

/// Default flush cadence.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest cadence; a zero period cannot drive a timer.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// A sink that can push buffered bytes to its destination on demand.
pub trait Flush: Send + Sync + 'static {
    fn flush(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Flushes a response sink until its scope is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicFlusher {
    interval: Duration,
}

impl Default for PeriodicFlusher {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL)
    }
}

impl PeriodicFlusher {
    /// Flush every `interval`, raised to [`MIN_FLUSH_INTERVAL`] if shorter.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_FLUSH_INTERVAL),
        }
    }

    /// Run [`PeriodicFlusher::run`] as a background task.
    pub fn spawn(self, sink: Option<Arc<dyn Flush>>, scope: Scope) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(sink, scope).await })
    }

    /// Flush `sink` once per interval until `scope` is cancelled.
    ///
    /// A missing sink means the response cannot be flushed; that only costs
    /// latency, so it is logged and the flusher exits. A failed flush means the
    /// client went away and also ends the loop.
    pub async fn run(self, sink: Option<Arc<dyn Flush>>, scope: Scope) {
        let Some(sink) = sink else {
            tracing::warn!("Response sink cannot be flushed; streaming without periodic flush");
            return;
        };

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {
                    // A flush blocked on a stalled client must not outlive the scope.
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => return,
                        flushed = sink.flush() => {
                            if let Err(e) = flushed {
                                tracing::debug!(error = %e, "Periodic flush failed; stopping");
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        flushes: AtomicUsize,
        fail: bool,
    }

    impl Flush for CountingSink {
        fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async move {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_every_interval_until_cancelled() {
        let sink = Arc::new(CountingSink::default());
        let scope = Scope::new();
        let handle =
            PeriodicFlusher::default().spawn(Some(sink.clone() as Arc<dyn Flush>), scope.clone());

        time::sleep(Duration::from_millis(1050)).await;
        let flushed = sink.flushes.load(Ordering::SeqCst);
        assert!((9..=11).contains(&flushed), "flushed {flushed} times");

        scope.cancel();
        handle.await.unwrap();
        let after_cancel = sink.flushes.load(Ordering::SeqCst);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), after_cancel);
        assert!(after_cancel <= flushed + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_flusher() {
        let sink = Arc::new(CountingSink::default());
        let parent = Scope::new();
        let handle = PeriodicFlusher::new(Duration::from_millis(10))
            .spawn(Some(sink.clone() as Arc<dyn Flush>), parent.child());

        time::sleep(Duration::from_millis(35)).await;
        parent.cancel();
        handle.await.unwrap();
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sink_exits_immediately() {
        let scope = Scope::new();
        let handle = PeriodicFlusher::default().spawn(None, scope.clone());

        time::timeout(Duration::from_millis(1), handle)
            .await
            .expect("flusher without a sink should exit at once")
            .unwrap();
        assert!(!scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_stops_flusher() {
        let sink = Arc::new(CountingSink {
            fail: true,
            ..Default::default()
        });
        let handle =
            PeriodicFlusher::default().spawn(Some(sink.clone() as Arc<dyn Flush>), Scope::new());

        handle.await.unwrap();
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_minimum() {
        let sink = Arc::new(CountingSink::default());
        let scope = Scope::new();
        let handle = PeriodicFlusher::new(Duration::ZERO)
            .spawn(Some(sink.clone() as Arc<dyn Flush>), scope.clone());

        time::sleep(Duration::from_millis(5) + Duration::from_micros(500)).await;
        scope.cancel();
        handle.await.unwrap();
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 5);
    }

    /// A sink whose flush never completes, like a client that stopped reading.
    struct StalledSink {
        started: AtomicUsize,
    }

    impl Flush for StalledSink {
        fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                std::future::pending().await
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_pending_flush() {
        let sink = Arc::new(StalledSink {
            started: AtomicUsize::new(0),
        });
        let scope = Scope::new();
        let handle = PeriodicFlusher::new(Duration::from_millis(10))
            .spawn(Some(sink.clone() as Arc<dyn Flush>), scope.clone());

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);

        scope.cancel();
        time::timeout(Duration::from_millis(1), handle)
            .await
            .expect("cancelled flusher should not wait on its sink")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_scope_never_flushes() {
        let sink = Arc::new(CountingSink::default());
        let scope = Scope::new();
        scope.cancel();

        PeriodicFlusher::default()
            .run(Some(sink.clone() as Arc<dyn Flush>), scope)
            .await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 0);
    }
}
