//! Per-row state machine
//!
//! One task runs: acquire the record mutex, resolve the effective
//! action from soft-delete state and filter transitions, project the
//! row, call the sink, release the mutex. Every outcome lands on the
//! task's batch; the dispatcher turns the aggregate into an
//! acknowledgement decision.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::lock::{LockStore, RecordLockManager};
use crate::metrics::standard::{LOCK_FAILURES, SINK_WRITES, SYNC_DURATION, TASK_FAILURES};
use crate::sinks::SinkPool;
use crate::sync::dispatcher::TaskSubmitter;
use crate::sync::filter::Filter;
use crate::sync::task::TaskGuard;

/// Result of one sync attempt: columns written, or a silent no-op
enum Applied {
    Done(Vec<String>),
    Empty,
}

/// Executes per-row tasks
pub struct SyncHandler {
    locks: RecordLockManager,
    sinks: Arc<SinkPool>,
    filter: Arc<dyn Filter>,
}

impl SyncHandler {
    pub fn new(store: Arc<dyn LockStore>, sinks: Arc<SinkPool>, filter: Arc<dyn Filter>) -> Self {
        Self {
            locks: RecordLockManager::new(store),
            sinks,
            filter,
        }
    }

    /// Runs one task to completion. Never returns an error: failures are
    /// recorded on the batch, a lock miss is a silent skip (the source
    /// redelivers).
    pub async fn run(&self, task: &mut TaskGuard, resubmit: &TaskSubmitter) {
        let started = Instant::now();

        let key = RecordLockManager::lock_key(&task.rule, &task.data);
        let _lock = match self.locks.lock(&key).await {
            Ok(guard) => guard,
            Err(e) => {
                LOCK_FAILURES.inc();
                warn!("abandoning task, relying on redelivery: {}", e);
                return;
            }
        };

        let outcome = match task.real_kind {
            EventKind::Insert => self.insert(task).await,
            EventKind::Update => self.update(task, resubmit).await,
            EventKind::Delete => self.delete(task).await,
        };

        match outcome {
            Ok(Applied::Done(columns)) => {
                SINK_WRITES.inc(&task.rule.sink_kind);
                if let Err(e) = self.filter.insert_event_record(task, &columns).await {
                    error!("event record bookkeeping failed: {}", e);
                    task.batch().record_error(e);
                }
            }
            Ok(Applied::Empty) => {}
            Err(e) => {
                TASK_FAILURES.inc();
                error!(
                    "sync failed for {}.{} row {}: {}",
                    task.rule.database,
                    task.rule.table,
                    task.primary_key_value(),
                    e
                );
                task.batch().record_error(e);
            }
        }

        SYNC_DURATION.observe_since(started);
    }

    async fn insert(&self, task: &TaskGuard) -> Result<Applied> {
        if !task.rule.matches(&task.data) {
            return Ok(Applied::Empty);
        }

        // A post-image already carrying the deleted marker never lands
        if let Some(field) = &task.rule.soft_delete_field {
            if let Some(value) = task.data.get(field) {
                if *value != task.rule.un_soft_delete_value {
                    return Ok(Applied::Empty);
                }
            }
        }

        let sink = self.sinks.get(&task.rule.sink_kind).await?;

        let candidates: Vec<String> = task.rule.columns.keys().cloned().collect();
        let Some(columns) = self.filter.filter_columns(task, candidates).await? else {
            return Ok(Applied::Empty);
        };

        let values = task.update_values(&columns);
        sink.insert(task, values).await?;

        Ok(Applied::Done(columns))
    }

    async fn update(&self, task: &mut TaskGuard, resubmit: &TaskSubmitter) -> Result<Applied> {
        // Identity change: the old row disappears and a new one appears.
        // Fan out an INSERT of the post-image and a DELETE of the
        // reconstructed pre-image row.
        if task.is_identity_change() {
            let insert_clone = task.clone_with_kind(EventKind::Insert);
            resubmit.submit(insert_clone)?;

            let mut delete_clone = task.clone_with_kind(EventKind::Delete);
            delete_clone.data = task.merge_old_to_data();
            delete_clone.old = None;
            resubmit.submit(delete_clone)?;

            return Ok(Applied::Empty);
        }

        if let Some(field) = task.rule.soft_delete_field.clone() {
            let old_value = task.old.as_ref().and_then(|old| old.get(&field)).cloned();
            if let Some(old_value) = old_value {
                if old_value == task.rule.un_soft_delete_value {
                    // Was live, the marker changed: soft-deleted now
                    task.real_kind = EventKind::Delete;
                    return self.delete(task).await;
                }
                if task.data.get(&field) == Some(&task.rule.un_soft_delete_value) {
                    // Was deleted, marker back to the sentinel: restored
                    task.real_kind = EventKind::Insert;
                    return self.insert(task).await;
                }
            }
        }

        let old_matches = task.rule.matches(&task.merge_old_to_data());
        let data_matches = task.rule.matches(&task.data);
        match (data_matches, old_matches) {
            (false, true) => {
                // Row left the filter
                task.real_kind = EventKind::Delete;
                self.delete(task).await
            }
            (true, false) => {
                // Row entered the filter
                task.real_kind = EventKind::Insert;
                self.insert(task).await
            }
            (false, false) => Ok(Applied::Empty),
            (true, true) => self.real_update(task).await,
        }
    }

    async fn real_update(&self, task: &TaskGuard) -> Result<Applied> {
        let sink = self.sinks.get(&task.rule.sink_kind).await?;

        // Only columns the update actually touched are candidates
        let candidates: Vec<String> = task
            .old
            .as_ref()
            .map(|old| old.keys().cloned().collect())
            .unwrap_or_default();
        let Some(columns) = self.filter.filter_columns(task, candidates).await? else {
            return Ok(Applied::Empty);
        };

        let values = task.update_values(&columns);
        sink.update(task, values).await?;

        Ok(Applied::Done(columns))
    }

    async fn delete(&self, task: &TaskGuard) -> Result<Applied> {
        let Some(_) = self.filter.filter_columns(task, Vec::new()).await? else {
            return Ok(Applied::Empty);
        };

        let sink = self.sinks.get(&task.rule.sink_kind).await?;
        sink.delete(task).await?;

        Ok(Applied::Done(Vec::new()))
    }
}
