//! Coordinator gateway contract
//!
//! Six primitives over a hierarchical key/value namespace with ephemeral
//! nodes and advisory locks. Watches are single-shot: after one event
//! the caller must re-register, exactly like the underlying services
//! deliver them.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::Result;

/// Node creation flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral with a server-assigned monotonic suffix
    EphemeralSequential,
}

/// One watch delivery. The watch is consumed by the event; re-register
/// to keep observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Node data was written (or the node was created)
    DataChanged,
    /// Node was deleted
    Deleted,
    /// Direct children were added or removed
    ChildrenChanged,
    /// The session owning this watch is gone; fatal to the watcher
    SessionLost,
}

/// Single-shot watch receiver. A closed channel means the session ended.
pub type WatchRx = oneshot::Receiver<NodeEvent>;

/// Held advisory lock; released on drop
pub trait CoordinatorLock: Send {}

/// Gateway to the coordination service
#[async_trait]
pub trait CoordinatorGateway: Send + Sync {
    /// Reads node data; `Ok(None)` when the node does not exist
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrites node data; the node must exist
    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Creates a node, returning its actual path (sequential modes append
    /// a suffix). Fails with `NodeExists` / `NoNode` (missing parent).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Deletes a node
    async fn delete(&self, path: &str) -> Result<()>;

    /// Current data plus a single-shot watch. Watching a non-existent
    /// path is allowed: the data half is `None` and the watch fires on
    /// creation.
    async fn watch_data(&self, path: &str) -> Result<(Option<Vec<u8>>, WatchRx)>;

    /// Current child names plus a single-shot watch for membership
    /// changes
    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchRx)>;

    /// Acquires the named advisory mutex, waiting until it is free
    async fn lock(&self, path: &str) -> Result<Box<dyn CoordinatorLock>>;

    /// False once the session has been lost; ephemeral nodes owned by
    /// this session are already gone
    fn session_alive(&self) -> bool;
}

/// Gets a node's data, creating it (empty) when absent. Tolerates a
/// concurrent creator winning the race.
pub async fn ensure_node(
    gateway: &dyn CoordinatorGateway,
    path: &str,
    mode: CreateMode,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = gateway.get(path).await? {
        return Ok(Some(data));
    }

    match gateway.create(path, Vec::new(), mode).await {
        Ok(_) => Ok(None),
        Err(crate::error::PorterError::NodeExists { .. }) => gateway.get(path).await,
        Err(e) => Err(e),
    }
}
