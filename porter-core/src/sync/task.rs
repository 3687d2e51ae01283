//! Per-row tasks and batch groups
//!
//! One task is one rule applied to one row of one event. Tasks and
//! batch groups are drawn from pools; recycling is tied to a guard so
//! the batch decrement happens on every exit path, unwinds included.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::PorterError;
use crate::event::{ChangeEvent, EventKind, Row};
use crate::rules::{SyncMode, SyncRule};

/// Values handed to a sink, shaped by the rule's sync mode
#[derive(Debug, Clone, PartialEq)]
pub enum SinkValues {
    /// Whole-row record (COPY)
    Record(HashMap<String, String>),
    /// Document carrying the nested object under the join field (JOIN)
    Document(serde_json::Value),
    /// Single element for set add/remove semantics (INNER)
    Element(String),
}

/// Barrier plus error list for one event's tasks
#[derive(Default)]
pub struct SyncBatch {
    pending: AtomicUsize,
    notify: Notify,
    errors: Mutex<Vec<PorterError>>,
}

impl SyncBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Blocks until every added task has completed
    pub async fn wait(&self) {
        loop {
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn record_error(&self, error: PorterError) {
        self.errors.lock().push(error);
    }

    /// First recorded error, if any. The event is acknowledged iff this
    /// is `None`.
    pub fn take_first_error(&self) -> Option<PorterError> {
        let mut errors = self.errors.lock();
        if errors.is_empty() {
            None
        } else {
            Some(errors.swap_remove(0))
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        self.errors.lock().clear();
    }
}

/// One rule applied to one row
#[derive(Debug)]
pub struct SyncTask {
    pub rule: Arc<SyncRule>,
    /// Post-image of the row
    pub data: Row,
    /// Pre-image (changed columns only); `None` when not delivered
    pub old: Option<Row>,
    /// Kind actually executed; diverges from the event kind on
    /// soft-delete and filter transitions
    pub real_kind: EventKind,
    pub event: Arc<ChangeEvent>,
}

impl SyncTask {
    /// Value of the source primary-key column in the post-image
    pub fn primary_key_value(&self) -> &str {
        self.data
            .get(&self.rule.primary_key)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Row as it looked before the update: pre-image values override the
    /// post-image, keyed by the post-image's columns
    pub fn merge_old_to_data(&self) -> Row {
        match &self.old {
            Some(old) => self
                .data
                .iter()
                .map(|(key, value)| {
                    let value = old.get(key).unwrap_or(value);
                    (key.clone(), value.clone())
                })
                .collect(),
            None => self.data.clone(),
        }
    }

    /// True when the update changed the row's identity: the primary key
    /// appears in the pre-image, or the join-source column does in INNER
    /// mode
    pub fn is_identity_change(&self) -> bool {
        let Some(old) = &self.old else {
            return false;
        };
        if old.contains_key(&self.rule.primary_key) {
            return true;
        }
        if self.rule.sync_mode == SyncMode::Inner {
            if let Some(join_column) = self.rule.join_column() {
                return old.contains_key(join_column);
            }
        }
        false
    }

    /// Builds the values written to the sink for `columns`, per the
    /// rule's sync mode
    pub fn update_values(&self, columns: &[String]) -> SinkValues {
        match self.rule.sync_mode {
            SyncMode::Copy => SinkValues::Record(self.projected_record(columns)),
            SyncMode::Join => {
                let record = self.projected_record(columns);
                let pk_target = self
                    .rule
                    .columns
                    .get(&self.rule.primary_key)
                    .cloned()
                    .unwrap_or_else(|| self.rule.primary_key.clone());
                let join_field = self.rule.join_field.clone().unwrap_or_default();

                let nested: serde_json::Map<String, serde_json::Value> = record
                    .into_iter()
                    .map(|(key, value)| (key, serde_json::Value::String(value)))
                    .collect();
                let mut doc = serde_json::Map::new();
                doc.insert(
                    pk_target,
                    serde_json::Value::String(self.primary_key_value().to_string()),
                );
                doc.insert(join_field, serde_json::Value::Object(nested));

                SinkValues::Document(serde_json::Value::Object(doc))
            }
            SyncMode::Inner => {
                let value = self
                    .rule
                    .join_column()
                    .and_then(|column| self.data.get(column))
                    .cloned()
                    .unwrap_or_default();
                SinkValues::Element(value)
            }
        }
    }

    /// Post-image projected through the column mapping, merged with the
    /// rule's constant extra fields
    fn projected_record(&self, columns: &[String]) -> HashMap<String, String> {
        let mut record = HashMap::with_capacity(columns.len() + self.rule.extra_fields.len());
        for column in columns {
            if let (Some(target), Some(value)) =
                (self.rule.columns.get(column), self.data.get(column))
            {
                record.insert(target.clone(), value.clone());
            }
        }
        for (column, value) in &self.rule.extra_fields {
            record.insert(column.clone(), value.clone());
        }
        record
    }
}

/// Pool of recycled batch groups
pub struct BatchPool {
    free: Mutex<Vec<Arc<SyncBatch>>>,
    max_free: usize,
}

impl BatchPool {
    pub fn new(max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_free,
        })
    }

    /// Acquire a reset batch
    pub fn acquire(&self) -> Arc<SyncBatch> {
        let batch = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(SyncBatch::new()));
        batch.reset();
        batch
    }

    /// Return a batch once its tasks are done. Batches still referenced
    /// elsewhere are left to the allocator.
    pub fn release(&self, batch: Arc<SyncBatch>) {
        if Arc::strong_count(&batch) == 1 {
            let mut free = self.free.lock();
            if free.len() < self.max_free {
                free.push(batch);
            }
        }
    }
}

type TaskSlot = Box<Option<SyncTask>>;

/// Pool of recycled task slots
pub struct TaskPool {
    free: Mutex<Vec<TaskSlot>>,
    max_free: usize,
}

impl TaskPool {
    pub fn new(max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_free,
        })
    }

    /// Checks a task out of the pool, registered on `batch`
    #[allow(clippy::too_many_arguments)]
    pub fn acquire(
        self: &Arc<Self>,
        batch: &Arc<SyncBatch>,
        rule: Arc<SyncRule>,
        data: Row,
        old: Option<Row>,
        event: Arc<ChangeEvent>,
        real_kind: EventKind,
    ) -> TaskGuard {
        batch.add();

        let mut slot = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(None));
        *slot = Some(SyncTask {
            rule,
            data,
            old,
            real_kind,
            event,
        });

        TaskGuard {
            slot: Some(slot),
            batch: batch.clone(),
            pool: self.clone(),
        }
    }

    fn release(&self, mut slot: TaskSlot) {
        *slot = None;
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(slot);
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Checked-out task. Dropping the guard marks the task done on its
/// batch and recycles the slot, on every exit path including unwinds.
pub struct TaskGuard {
    slot: Option<TaskSlot>,
    batch: Arc<SyncBatch>,
    pool: Arc<TaskPool>,
}

impl TaskGuard {
    pub fn batch(&self) -> &Arc<SyncBatch> {
        &self.batch
    }

    /// New task on the same batch with the same images but a different
    /// kind; used for identity-change fan-out
    pub fn clone_with_kind(&self, real_kind: EventKind) -> TaskGuard {
        let task = self.deref();
        self.pool.acquire(
            &self.batch,
            task.rule.clone(),
            task.data.clone(),
            task.old.clone(),
            task.event.clone(),
            real_kind,
        )
    }
}

impl Deref for TaskGuard {
    type Target = SyncTask;

    fn deref(&self) -> &SyncTask {
        self.slot
            .as_deref()
            .and_then(|slot| slot.as_ref())
            .expect("task slot present while guard is live")
    }
}

impl DerefMut for TaskGuard {
    fn deref_mut(&mut self) -> &mut SyncTask {
        self.slot
            .as_deref_mut()
            .and_then(|slot| slot.as_mut())
            .expect("task slot present while guard is live")
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
        self.batch.done();
    }
}
