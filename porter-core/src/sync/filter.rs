//! Column filter seam
//!
//! An external collaborator may veto or narrow the column set of each
//! write, and persist which columns a row changed at which timestamp so
//! a later, staler event does not clobber fresher data. The default
//! filter passes everything through.

use async_trait::async_trait;

use crate::error::Result;
use crate::sync::task::SyncTask;

/// Per-write column filter
#[async_trait]
pub trait Filter: Send + Sync {
    /// Narrows the candidate column set for one write. `Ok(None)` means
    /// the write is not applicable and the task ends as a silent no-op.
    async fn filter_columns(
        &self,
        task: &SyncTask,
        columns: Vec<String>,
    ) -> Result<Option<Vec<String>>>;

    /// Records the (row, updated columns, timestamp) triple after a
    /// successful write
    async fn insert_event_record(&self, task: &SyncTask, columns: &[String]) -> Result<()>;
}

/// Filter that admits every write unchanged
pub struct EmptyFilter;

#[async_trait]
impl Filter for EmptyFilter {
    async fn filter_columns(
        &self,
        _task: &SyncTask,
        columns: Vec<String>,
    ) -> Result<Option<Vec<String>>> {
        Ok(Some(columns))
    }

    async fn insert_event_record(&self, _task: &SyncTask, _columns: &[String]) -> Result<()> {
        Ok(())
    }
}
