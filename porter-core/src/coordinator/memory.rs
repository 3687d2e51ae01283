//! In-process coordinator
//!
//! A complete implementation of the gateway contract over process-local
//! state: ephemeral nodes tied to session handles, zero-padded
//! sequential suffixes, single-shot watches, and advisory mutexes.
//! Every integration test and the single-node binary run against this.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::gateway::{CoordinatorGateway, CoordinatorLock, CreateMode, NodeEvent, WatchRx};
use crate::error::{PorterError, Result};

struct NodeRecord {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
}

struct Watcher {
    session: u64,
    tx: oneshot::Sender<NodeEvent>,
}

#[derive(Default)]
struct SpaceInner {
    nodes: BTreeMap<String, NodeRecord>,
    sequences: HashMap<String, u64>,
    data_watches: HashMap<String, Vec<Watcher>>,
    child_watches: HashMap<String, Vec<Watcher>>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_session: u64,
}

/// Shared namespace; sessions are opened against one space
pub struct CoordinatorSpace {
    inner: Mutex<SpaceInner>,
}

impl CoordinatorSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SpaceInner::default()),
        })
    }

    /// Opens a new session handle
    pub fn session(self: &Arc<Self>) -> MemoryCoordinator {
        let session = {
            let mut inner = self.inner.lock();
            inner.next_session += 1;
            inner.next_session
        };

        MemoryCoordinator {
            space: self.clone(),
            session,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) => None, // top-level node, implicit root parent
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn notify_data(inner: &mut SpaceInner, path: &str, event: NodeEvent) {
    if let Some(watchers) = inner.data_watches.remove(path) {
        for watcher in watchers {
            let _ = watcher.tx.send(event);
        }
    }
}

fn notify_children(inner: &mut SpaceInner, path: &str) {
    if let Some(parent) = parent_of(path) {
        if let Some(watchers) = inner.child_watches.remove(parent) {
            for watcher in watchers {
                let _ = watcher.tx.send(NodeEvent::ChildrenChanged);
            }
        }
    }
}

/// One session against a [`CoordinatorSpace`]. Dropping or closing the
/// handle ends the session: its ephemeral nodes disappear and its
/// watchers observe `SessionLost`.
pub struct MemoryCoordinator {
    space: Arc<CoordinatorSpace>,
    session: u64,
    alive: Arc<AtomicBool>,
}

impl MemoryCoordinator {
    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PorterError::SessionLost)
        }
    }

    /// Ends the session. Idempotent.
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let mut inner = self.space.inner.lock();
            self.expire_session(&mut inner);
        }
    }

    fn expire_session(&self, inner: &mut SpaceInner) {
        let ephemerals: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, record)| record.owner == Some(self.session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in ephemerals {
            debug!("session {} expired, removing {}", self.session, path);
            inner.nodes.remove(&path);
            notify_data(inner, &path, NodeEvent::Deleted);
            notify_children(inner, &path);
        }

        // Wake this session's own watchers so its workers fail fast
        for watches in [&mut inner.data_watches, &mut inner.child_watches] {
            for watchers in watches.values_mut() {
                let mut remaining = Vec::new();
                for watcher in watchers.drain(..) {
                    if watcher.session == self.session {
                        let _ = watcher.tx.send(NodeEvent::SessionLost);
                    } else {
                        remaining.push(watcher);
                    }
                }
                *watchers = remaining;
            }
        }
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl CoordinatorLock for MemoryLock {}

#[async_trait]
impl CoordinatorGateway for MemoryCoordinator {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_alive()?;
        let inner = self.space.inner.lock();
        Ok(inner.nodes.get(path).map(|record| record.data.clone()))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        let mut inner = self.space.inner.lock();

        match inner.nodes.get_mut(path) {
            Some(record) => record.data = data,
            None => {
                return Err(PorterError::NoNode {
                    path: path.to_string(),
                })
            }
        }
        notify_data(&mut inner, path, NodeEvent::DataChanged);

        Ok(())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_alive()?;
        let mut inner = self.space.inner.lock();

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let counter = inner.sequences.entry(path.to_string()).or_insert(0);
                let suffix = *counter;
                *counter += 1;
                format!("{path}{suffix:010}")
            }
            _ => path.to_string(),
        };

        if inner.nodes.contains_key(&actual) {
            return Err(PorterError::NodeExists { path: actual });
        }
        if let Some(parent) = parent_of(&actual) {
            if !inner.nodes.contains_key(parent) {
                return Err(PorterError::NoNode {
                    path: parent.to_string(),
                });
            }
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.session),
        };
        inner.nodes.insert(actual.clone(), NodeRecord { data, owner });

        notify_data(&mut inner, &actual, NodeEvent::DataChanged);
        notify_children(&mut inner, &actual);

        Ok(actual)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_alive()?;
        let mut inner = self.space.inner.lock();

        if inner.nodes.remove(path).is_none() {
            return Err(PorterError::NoNode {
                path: path.to_string(),
            });
        }
        notify_data(&mut inner, path, NodeEvent::Deleted);
        notify_children(&mut inner, path);

        Ok(())
    }

    async fn watch_data(&self, path: &str) -> Result<(Option<Vec<u8>>, WatchRx)> {
        self.check_alive()?;
        let mut inner = self.space.inner.lock();

        let data = inner.nodes.get(path).map(|record| record.data.clone());
        let (tx, rx) = oneshot::channel();
        inner
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher {
                session: self.session,
                tx,
            });

        Ok((data, rx))
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchRx)> {
        self.check_alive()?;
        let mut inner = self.space.inner.lock();

        if !inner.nodes.contains_key(path) {
            return Err(PorterError::NoNode {
                path: path.to_string(),
            });
        }

        let prefix = format!("{path}/");
        let children: Vec<String> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter(|(name, _)| !name[prefix.len()..].contains('/'))
            .map(|(name, _)| name[prefix.len()..].to_string())
            .collect();

        let (tx, rx) = oneshot::channel();
        inner
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher {
                session: self.session,
                tx,
            });

        Ok((children, rx))
    }

    async fn lock(&self, path: &str) -> Result<Box<dyn CoordinatorLock>> {
        self.check_alive()?;
        let mutex = {
            let mut inner = self.space.inner.lock();
            // Record-lock paths are unbounded (one per row identity ever
            // locked); sweep entries nobody holds or awaits so the map
            // tracks live contention only
            inner.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            inner
                .locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;
        Ok(Box::new(MemoryLock { _guard: guard }))
    }

    fn session_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_children() {
        let space = CoordinatorSpace::new();
        let session = space.session();

        session
            .create("/porter", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        session
            .create("/porter/followers", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let first = session
            .create(
                "/porter/followers/follower-",
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await
            .unwrap();
        let second = session
            .create(
                "/porter/followers/follower-",
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await
            .unwrap();

        assert_eq!(first, "/porter/followers/follower-0000000000");
        assert_eq!(second, "/porter/followers/follower-0000000001");

        let (children, _rx) = session.watch_children("/porter/followers").await.unwrap();
        assert_eq!(children.len(), 2);
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_die_with_session() {
        let space = CoordinatorSpace::new();
        let owner = space.session();
        let observer = space.session();

        owner
            .create("/porter", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        owner
            .create("/porter/leader", b"nonce".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let (data, rx) = observer.watch_data("/porter/leader").await.unwrap();
        assert_eq!(data.as_deref(), Some(b"nonce".as_slice()));

        owner.close();

        assert_eq!(rx.await.unwrap(), NodeEvent::Deleted);
        assert!(observer.get("/porter/leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watches_are_single_shot() {
        let space = CoordinatorSpace::new();
        let session = space.session();

        session
            .create("/porter", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        session
            .create("/porter/rules", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let (_, rx) = session.watch_data("/porter/rules").await.unwrap();
        session.set("/porter/rules", b"a".to_vec()).await.unwrap();
        assert_eq!(rx.await.unwrap(), NodeEvent::DataChanged);

        // Second write without re-registration goes unobserved; the next
        // registration sees the latest data
        session.set("/porter/rules", b"b".to_vec()).await.unwrap();
        let (data, _rx) = session.watch_data("/porter/rules").await.unwrap();
        assert_eq!(data.as_deref(), Some(b"b".as_slice()));
    }

    #[tokio::test]
    async fn test_session_loss_wakes_own_watchers() {
        let space = CoordinatorSpace::new();
        let session = space.session();

        session
            .create("/porter", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let (_, rx) = session.watch_data("/porter").await.unwrap();

        session.close();

        assert_eq!(rx.await.unwrap(), NodeEvent::SessionLost);
        assert!(matches!(
            session.get("/porter").await,
            Err(PorterError::SessionLost)
        ));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let space = CoordinatorSpace::new();
        let session = space.session();

        let err = session
            .create("/porter/rules", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, PorterError::NoNode { .. }));
    }

    #[tokio::test]
    async fn test_released_locks_are_evicted() {
        let space = CoordinatorSpace::new();
        let session = space.session();

        let guard = session.lock("/porter/lock-a").await.unwrap();
        assert_eq!(space.inner.lock().locks.len(), 1);
        drop(guard);

        // The next acquisition sweeps the idle entry
        let _guard = session.lock("/porter/lock-b").await.unwrap();
        let held: Vec<String> = space.inner.lock().locks.keys().cloned().collect();
        assert_eq!(held, ["/porter/lock-b"]);
    }

    #[tokio::test]
    async fn test_named_mutex_excludes() {
        let space = CoordinatorSpace::new();
        let a = space.session();
        let b = space.session();

        let guard = a.lock("/porter/event-lock").await.unwrap();

        let waiter = tokio::spawn({
            let b = std::sync::Arc::new(b);
            async move { b.lock("/porter/event-lock").await.map(|_| ()) }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}
