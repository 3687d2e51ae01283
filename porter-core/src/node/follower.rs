//! Follower role
//!
//! Registers membership as an ephemeral sequential child of the
//! followers root, reacts to broadcast assignments by reconciling its
//! local readers, keeps the rule map and sink pool current, and
//! competes for the leader node whenever it is absent.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    watch_data_loop, FollowerTasks, EVENT_LOCK_PATH, FOLLOWER_ROOT_PATH, LEADER_PATH, RULES_PATH,
    WRITERS_PATH,
};
use crate::coordinator::{CoordinatorGateway, CreateMode, NodeEvent};
use crate::error::{PorterError, Result};
use crate::lock::LockStore;
use crate::metrics::standard::{ACTIVE_READERS, EVENTS_ACKED, EVENTS_RECEIVED, IS_LEADER};
use crate::node::leader::Leader;
use crate::readers::{hash_id, Reader, ReaderFactory};
use crate::rules::SyncRule;
use crate::runtime::{DownSignal, Runner};
use crate::sinks::{SinkEndpoint, SinkPool};
use crate::sync::dispatcher::SharedRules;
use crate::sync::{Dispatcher, Filter, SyncHandler};

/// The consumer role every porter process runs
pub struct Follower {
    gateway: Arc<dyn CoordinatorGateway>,
    rules: SharedRules,
    readers: tokio::sync::Mutex<HashMap<String, Arc<dyn Reader>>>,
    factory: parking_lot::RwLock<ReaderFactory>,
    runner: Runner,
    down: DownSignal,
    dispatcher: Arc<Dispatcher>,
    sinks: Arc<SinkPool>,
    token: CancellationToken,
    leader: tokio::sync::Mutex<Option<Arc<Leader>>>,
    my_path: OnceLock<String>,
}

impl Follower {
    pub fn new(
        parent: &CancellationToken,
        gateway: Arc<dyn CoordinatorGateway>,
        lock_store: Arc<dyn LockStore>,
        sinks: Arc<SinkPool>,
        filter: Arc<dyn Filter>,
        pool_size: usize,
    ) -> Arc<Self> {
        let token = parent.child_token();
        let down = DownSignal::new();
        let runner = Runner::new(&token, down.clone());
        let rules: SharedRules = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let handler = Arc::new(SyncHandler::new(lock_store, sinks.clone(), filter));
        let dispatcher = Dispatcher::new(handler, rules.clone(), pool_size);
        let factory = ReaderFactory::new(token.clone());

        Arc::new(Self {
            gateway,
            rules,
            readers: tokio::sync::Mutex::new(HashMap::new()),
            factory: parking_lot::RwLock::new(factory),
            runner,
            down,
            dispatcher,
            sinks,
            token,
            leader: tokio::sync::Mutex::new(None),
            my_path: OnceLock::new(),
        })
    }

    /// Replaces the reader factory; the queue-connector seam for
    /// embedders that bring a real consumer-group client
    pub fn set_reader_factory(&self, factory: ReaderFactory) {
        *self.factory.write() = factory;
    }

    /// This follower's cancellation scope; readers and the leader role
    /// nest under it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Path of this follower's znode, once registered
    pub fn path(&self) -> Option<&str> {
        self.my_path.get().map(String::as_str)
    }

    /// True while this process holds the leader role
    pub async fn is_leader(&self) -> bool {
        self.leader.lock().await.is_some()
    }

    /// Registers membership and runs until shutdown. Returns the last
    /// reader-close error, matching the teardown contract.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        // Register under the event lock so the leader never observes a
        // half-initialized membership
        let guard = self.gateway.lock(EVENT_LOCK_PATH).await?;
        let created = self
            .gateway
            .create(
                &format!("{FOLLOWER_ROOT_PATH}/follower-"),
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await;
        drop(guard);

        let my_path = created?;
        info!("follower registered at {}", my_path);
        let _ = self.my_path.set(my_path.clone());

        let this = self.clone();
        self.runner.run_worker("writers-watch", move |token| {
            let follower = this.clone();
            let gateway = follower.gateway.clone();
            async move {
                watch_data_loop(gateway, WRITERS_PATH.to_string(), token, |data| {
                    let follower = follower.clone();
                    async move { follower.writer_configs_changed(data).await }
                })
                .await
            }
        });

        let this = self.clone();
        let own_path = my_path.clone();
        self.runner.run_worker("assignments-watch", move |token| {
            let follower = this.clone();
            let gateway = follower.gateway.clone();
            let own_path = own_path.clone();
            async move {
                watch_data_loop(gateway, own_path, token, |data| {
                    let follower = follower.clone();
                    async move { follower.reader_configs_changed(data).await }
                })
                .await
            }
        });

        let this = self.clone();
        self.runner.run_worker("rules-watch", move |token| {
            let follower = this.clone();
            let gateway = follower.gateway.clone();
            async move {
                watch_data_loop(gateway, RULES_PATH.to_string(), token, |data| {
                    let follower = follower.clone();
                    async move { follower.rules_changed(data) }
                })
                .await
            }
        });

        // Every process competes for the leader node; the follower of
        // the winning process keeps running alongside its leader role
        let this = self.clone();
        self.runner
            .run_worker("leader-watch", move |token| {
                let follower = this.clone();
                async move { follower.leader_watch(token).await }
            });

        self.down.wait().await;
        self.finalize().await
    }

    /// Cancels everything and waits for the supervised workers; `run`
    /// performs the remaining teardown when the down signal lands
    pub async fn stop(&self) {
        self.token.cancel();
        self.runner.stop().await;
    }

    async fn finalize(&self) -> Result<()> {
        // The runner may have stopped itself; make sure the whole scope
        // is cancelled either way
        self.token.cancel();

        self.sinks.release().await;

        let mut last_err = None;
        let mut readers = self.readers.lock().await;
        for (unique_id, reader) in readers.drain() {
            if let Err(e) = reader.close().await {
                error!("close reader {} failed: {}", unique_id, e);
                last_err = Some(e);
            }
        }
        drop(readers);
        ACTIVE_READERS.set(0);

        self.dispatcher.shutdown().await;

        if let Some(leader) = self.leader.lock().await.take() {
            leader.stop().await;
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sink-config znode payload: `{kind: {instance: endpoint}}`
    async fn writer_configs_changed(&self, data: Vec<u8>) -> Result<()> {
        let configs: HashMap<String, HashMap<String, SinkEndpoint>> =
            serde_json::from_slice(&data).map_err(|e| PorterError::Decode {
                message: format!("writer configs: {e}"),
            })?;

        self.sinks.set_configs(configs).await
    }

    /// Rules znode payload: `{"db_table": [rule, ...]}`
    fn rules_changed(&self, data: Vec<u8>) -> Result<()> {
        let rules: HashMap<String, Vec<SyncRule>> =
            serde_json::from_slice(&data).map_err(|e| PorterError::Decode {
                message: format!("rules: {e}"),
            })?;

        let rules: HashMap<String, Vec<Arc<SyncRule>>> = rules
            .into_iter()
            .map(|(key, group)| (key, group.into_iter().map(Arc::new).collect()))
            .collect();

        *self.rules.write() = rules;
        Ok(())
    }

    /// Own-znode payload: this follower's assigned readers. Equal
    /// configs keep their reader, changed ones are replaced, absent ones
    /// are closed.
    async fn reader_configs_changed(self: &Arc<Self>, data: Vec<u8>) -> Result<()> {
        let tasks: FollowerTasks = serde_json::from_slice(&data).map_err(|e| {
            PorterError::Decode {
                message: format!("assignment: {e}"),
            }
        })?;

        let mut readers = self.readers.lock().await;

        for (unique_id, config) in &tasks.readers {
            if let Some(existing) = readers.get(unique_id) {
                if existing.config() == config {
                    continue;
                }
                info!("reader {} config changed, replacing", unique_id);
                if let Err(e) = existing.close().await {
                    error!("close reader {} failed: {}", unique_id, e);
                }
                readers.remove(unique_id);
            }

            info!("starting reader {}", unique_id);
            let factory = self.factory.read().clone();
            let reader = match factory.build(config.clone()).await {
                Ok(reader) => reader,
                Err(e) => {
                    error!("reader {} initialization failed: {}", unique_id, e);
                    continue;
                }
            };
            readers.insert(unique_id.clone(), reader.clone());

            let follower = self.clone();
            self.runner
                .run_worker(&format!("reader-{unique_id}"), move |token| {
                    let follower = follower.clone();
                    let reader = reader.clone();
                    async move { follower.listen(reader, token).await }
                });
        }

        let removed: Vec<String> = readers
            .keys()
            .filter(|unique_id| !tasks.readers.contains_key(*unique_id))
            .cloned()
            .collect();
        for unique_id in removed {
            info!("reader {} unassigned, closing", unique_id);
            if let Some(reader) = readers.remove(&unique_id) {
                if let Err(e) = reader.close().await {
                    error!("close reader {} failed: {}", unique_id, e);
                }
            }
        }

        ACTIVE_READERS.set(readers.len() as i64);
        Ok(())
    }

    /// Listen loop for one reader: dispatch non-DDL events, acknowledge
    /// on success, acknowledge DDL events without applying
    async fn listen(&self, reader: Arc<dyn Reader>, token: CancellationToken) {
        let reader_token = reader.token();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                _ = reader_token.cancelled() => return,
                next = reader.read() => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("reader {} closed", reader.config().unique_id());
                    return;
                }
                Err(e) => {
                    warn!("reader {} read failed: {}", reader.config().unique_id(), e);
                    continue;
                }
            };

            EVENTS_RECEIVED.inc();
            let event = Arc::new(event);

            if !event.is_ddl {
                if let Err(e) = self.dispatcher.dispatch(event.clone()).await {
                    // Not acknowledged; the source redelivers
                    error!("event {} not acknowledged: {}", event.event_id, e);
                    continue;
                }
            }

            match reader.complete(&event).await {
                Ok(()) => EVENTS_ACKED.inc(),
                Err(e) => error!("acknowledge {} failed: {}", event.event_id, e),
            }
        }
    }

    /// Competes for the leader node; on winning, runs the leader role
    /// inline until it stops
    async fn leader_watch(self: &Arc<Self>, token: CancellationToken) {
        loop {
            let existing = match self.gateway.get(LEADER_PATH).await {
                Ok(existing) => existing,
                Err(e) => panic!("read leader node failed: {e}"),
            };

            if existing.is_none() {
                match self.preempt_leader().await {
                    Ok(()) => return,
                    Err(PorterError::NodeExists { .. }) => {
                        // Lost the race; fall through and watch the
                        // winner
                    }
                    Err(e) => panic!("leader preemption failed: {e}"),
                }
            }

            let (_, rx) = match self.gateway.watch_data(LEADER_PATH).await {
                Ok(watch) => watch,
                Err(e) => panic!("watch leader node failed: {e}"),
            };

            tokio::select! {
                event = rx => match event {
                    Ok(NodeEvent::SessionLost) | Err(_) => panic!("session lost watching leader node"),
                    // Deleted re-enters the race; any other delivery
                    // just re-registers
                    Ok(_) => {}
                },
                _ = token.cancelled() => return,
            }
        }
    }

    async fn preempt_leader(self: &Arc<Self>) -> Result<()> {
        let nonce = leader_nonce();
        self.gateway
            .create(LEADER_PATH, nonce.clone().into_bytes(), CreateMode::Ephemeral)
            .await?;

        info!("won the leader node");
        IS_LEADER.set(1);

        let leader = Leader::new(&self.token, self.gateway.clone(), nonce);
        *self.leader.lock().await = Some(leader.clone());

        let result = leader.run().await;
        IS_LEADER.set(0);
        *self.leader.lock().await = None;
        result
    }
}

/// Opaque nonce identifying one leader incarnation
fn leader_nonce() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();
    hash_id(&format!("{}-{}", nanos, std::process::id()))
}
