//! Event dispatcher
//!
//! Fans one event out into per-row tasks per matching rule, feeds them
//! to the bounded worker pool without blocking, and decides
//! acknowledgement from the batch outcome.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::{PorterError, Result};
use crate::event::ChangeEvent;
use crate::metrics::standard::{TASKS_SUBMITTED, TASK_FAILURES};
use crate::rules::SyncRule;
use crate::sync::handler::SyncHandler;
use crate::sync::task::{BatchPool, TaskGuard, TaskPool};

/// Default bounded worker-pool size
pub const DEFAULT_POOL_SIZE: usize = 50;

/// Rule map shared between the rules watcher (single writer) and the
/// dispatchers (many readers)
pub type SharedRules = Arc<RwLock<HashMap<String, Vec<Arc<SyncRule>>>>>;

/// Non-blocking handle for putting tasks on the worker pool
#[derive(Clone)]
pub struct TaskSubmitter {
    tx: mpsc::Sender<TaskGuard>,
}

impl TaskSubmitter {
    /// Submits without blocking; a saturated pool is an error and the
    /// task is recycled immediately
    pub fn submit(&self, guard: TaskGuard) -> Result<()> {
        TASKS_SUBMITTED.inc();
        self.tx.try_send(guard).map_err(|_| PorterError::PoolSaturated)
    }
}

/// Bounded worker pool plus the per-event fan-out
pub struct Dispatcher {
    submitter: TaskSubmitter,
    rules: SharedRules,
    tasks: Arc<TaskPool>,
    batches: Arc<BatchPool>,
    workers: TaskTracker,
    worker_token: CancellationToken,
}

impl Dispatcher {
    pub fn new(handler: Arc<SyncHandler>, rules: SharedRules, pool_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(pool_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let submitter = TaskSubmitter { tx };
        let workers = TaskTracker::new();
        let worker_token = CancellationToken::new();

        for _ in 0..pool_size.max(1) {
            workers.spawn(worker_loop(
                rx.clone(),
                handler.clone(),
                submitter.clone(),
                worker_token.clone(),
            ));
        }
        workers.close();

        Arc::new(Self {
            submitter,
            rules,
            tasks: TaskPool::new(pool_size.max(1) * 2),
            batches: BatchPool::new(64),
            workers,
            worker_token,
        })
    }

    /// Dispatches one event and blocks until every task completed.
    /// `Ok(())` means the event may be acknowledged. An event matching
    /// no rule group is acknowledged: no work to do is not an error.
    pub async fn dispatch(&self, event: Arc<ChangeEvent>) -> Result<()> {
        let rule_key = event.rule_key();
        let rules = {
            let map = self.rules.read();
            map.get(&rule_key).cloned()
        };
        let Some(rules) = rules.filter(|rules| !rules.is_empty()) else {
            debug!("no rules registered for {}", rule_key);
            return Ok(());
        };

        let batch = self.batches.acquire();
        for rule in &rules {
            for (i, datum) in event.data.iter().enumerate() {
                let old = event.pre_image(i).cloned();
                let guard = self.tasks.acquire(
                    &batch,
                    rule.clone(),
                    datum.clone(),
                    old,
                    event.clone(),
                    event.kind,
                );
                if let Err(e) = self.submitter.submit(guard) {
                    warn!("worker pool saturated, recording batch error");
                    batch.record_error(e);
                }
            }
        }

        batch.wait().await;
        let outcome = batch.take_first_error();
        self.batches.release(batch);

        match outcome {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops the worker pool after in-flight tasks finish. Call only
    /// once no dispatches are in progress.
    pub async fn shutdown(&self) {
        self.worker_token.cancel();
        self.workers.wait().await;
    }
}

async fn worker_loop(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TaskGuard>>>,
    handler: Arc<SyncHandler>,
    submitter: TaskSubmitter,
    token: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                guard = rx.recv() => guard,
            }
        };
        let Some(mut guard) = next else {
            return;
        };

        // A panic below the state machine is recovered here: logged,
        // recorded as a batch error, and the guards' drops release the
        // record mutex and recycle the task
        let run = std::panic::AssertUnwindSafe(handler.run(&mut guard, &submitter))
            .catch_unwind()
            .await;
        if let Err(payload) = run {
            TASK_FAILURES.inc();
            let message = if let Some(message) = payload.downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "opaque panic payload".to_string()
            };
            error!("sync task panicked: {}", message);
            guard.batch().record_error(PorterError::TaskPanicked { message });
        }
    }
}
