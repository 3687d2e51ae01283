//! Supervised worker runner
//!
//! `run_worker` starts a long-running loop on its own task and restarts
//! it whenever it panics. A bookkeeper inspects the panic count every
//! 300 s: at or above the budget the whole runner shuts down, otherwise
//! the count resets. Stopping cancels every worker, waits for them, and
//! trips the caller-provided down latch.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::metrics::standard::WORKER_PANICS;

/// Window between panic-count inspections
pub const FAILURE_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// Panics per window that force a shutdown
pub const MAX_FAILURES: usize = 10;

/// One-shot latch a runner trips when it has fully stopped. The owning
/// role hands one in and awaits it to sequence its own teardown; a
/// tripped latch stays down, so late waiters resolve immediately.
#[derive(Clone, Default)]
pub struct DownSignal {
    latch: CancellationToken,
}

impl DownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once the runner has stopped
    pub async fn wait(&self) {
        self.latch.cancelled().await;
    }

    /// True once tripped
    pub fn is_down(&self) -> bool {
        self.latch.is_cancelled()
    }

    fn trip(&self) {
        self.latch.cancel();
    }
}

struct RunnerInner {
    token: CancellationToken,
    tracker: TaskTracker,
    panic_tx: mpsc::Sender<()>,
    down: DownSignal,
}

/// Supervisor for long-running worker loops
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Creates a runner whose workers observe a child of `parent` and
    /// whose full stop trips `down`
    pub fn new(parent: &CancellationToken, down: DownSignal) -> Self {
        let (panic_tx, panic_rx) = mpsc::channel(MAX_FAILURES);
        let inner = Arc::new(RunnerInner {
            token: parent.child_token(),
            tracker: TaskTracker::new(),
            panic_tx,
            down,
        });

        // The bookkeeper is deliberately untracked: stop() waits on the
        // tracker and the bookkeeper may be the caller of stop()
        tokio::spawn(bookkeeper(inner.clone(), panic_rx));

        Self { inner }
    }

    /// Cancellation scope handed to workers
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Starts a supervised worker. `f` is re-invoked to restart the
    /// worker after each panic; returning normally ends the worker for
    /// good.
    pub fn run_worker<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.inner.token.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        let name = name.to_string();
        self.inner.tracker.spawn(supervise(inner, name, f));
    }

    /// Cancels all workers, waits for them to exit, and trips the down
    /// latch
    pub async fn stop(&self) {
        stop_runner(&self.inner).await;
    }
}

async fn stop_runner(inner: &Arc<RunnerInner>) {
    inner.token.cancel();
    inner.tracker.close();
    inner.tracker.wait().await;
    inner.down.trip();
}

async fn supervise<F, Fut>(inner: Arc<RunnerInner>, name: String, f: F)
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        if inner.token.is_cancelled() {
            return;
        }

        let handle = tokio::spawn(f(inner.token.clone()));
        match handle.await {
            Ok(()) => {
                // Clean exit; no restart
                return;
            }
            Err(join_err) if join_err.is_panic() => {
                WORKER_PANICS.inc();
                let message = panic_message(join_err.into_panic());
                error!("worker {} panicked: {}; restarting", name, message);

                if inner.panic_tx.try_send(()).is_err() {
                    // More queued panics than the bookkeeper can consume
                    error!("panic budget exhausted, initiating shutdown");
                    let inner = inner.clone();
                    tokio::spawn(async move { stop_runner(&inner).await });
                    return;
                }
            }
            Err(_) => {
                // Aborted during teardown
                return;
            }
        }
    }
}

async fn bookkeeper(inner: Arc<RunnerInner>, mut panic_rx: mpsc::Receiver<()>) {
    let start = tokio::time::Instant::now() + FAILURE_CHECK_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, FAILURE_CHECK_INTERVAL);
    let mut failures = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if failures >= MAX_FAILURES {
                    error!("{} worker panics within the window, shutting down", failures);
                    stop_runner(&inner).await;
                    return;
                }
                failures = 0;
            }
            received = panic_rx.recv() => {
                if received.is_none() {
                    return;
                }
                failures += 1;
                if failures >= MAX_FAILURES {
                    error!("{} worker panics within the window, shutting down", failures);
                    stop_runner(&inner).await;
                    return;
                }
            }
            _ = inner.token.cancelled() => {
                info!("runner cancelled, bookkeeper exiting");
                return;
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_worker_restarts_after_panic() {
        let down = DownSignal::new();
        let runner = Runner::new(&CancellationToken::new(), down.clone());
        let attempts = Arc::new(AtomicUsize::new(0));

        let seen = attempts.clone();
        runner.run_worker("flaky", move |_token| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run dies");
                }
            }
        });

        // First run panics, second runs to clean completion
        tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        runner.stop().await;
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let runner = Runner::new(&CancellationToken::new(), DownSignal::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let seen = attempts.clone();
        runner.run_worker("oneshot", move |_token| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        runner.stop().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_storm_trips_down() {
        let down = DownSignal::new();
        let runner = Runner::new(&CancellationToken::new(), down.clone());
        let attempts = Arc::new(AtomicUsize::new(0));

        let seen = attempts.clone();
        runner.run_worker("storm", move |token| {
            let seen = seen.clone();
            async move {
                if token.is_cancelled() {
                    return;
                }
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("storm");
            }
        });

        tokio::time::timeout(Duration::from_secs(10), down.wait())
            .await
            .expect("panic storm should force shutdown");
        assert!(attempts.load(Ordering::SeqCst) >= MAX_FAILURES);
        assert!(down.is_down());
    }

    #[tokio::test]
    async fn test_down_latch_stays_down() {
        let down = DownSignal::new();
        let runner = Runner::new(&CancellationToken::new(), down.clone());

        assert!(!down.is_down());
        runner.stop().await;
        runner.stop().await;

        // One observable transition; late waiters resolve immediately
        assert!(down.is_down());
        tokio::time::timeout(Duration::from_secs(1), down.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), down.wait())
            .await
            .unwrap();
    }
}
