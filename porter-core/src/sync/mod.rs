//! Sync pipeline
//!
//! Events fan out into pooled per-row tasks, a bounded worker pool runs
//! the per-row state machine, and the batch barrier decides
//! acknowledgement.

pub mod dispatcher;
pub mod filter;
pub mod handler;
pub mod task;

pub use dispatcher::{Dispatcher, SharedRules};
pub use filter::{EmptyFilter, Filter};
pub use handler::SyncHandler;
pub use task::{BatchPool, SinkValues, SyncBatch, SyncTask, TaskGuard, TaskPool};
