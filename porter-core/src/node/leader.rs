//! Leader role
//!
//! The leader owns the reader-to-follower assignment: it watches the
//! follower membership and the reader catalog, keeps placements stable
//! across catalog updates, and broadcasts the assignment map to the
//! followers root and each follower's znode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    watch_children_loop, watch_data_loop, AssignmentMap, EVENT_LOCK_PATH, FOLLOWER_ROOT_PATH,
    LEADER_PATH, READERS_PATH,
};
use crate::coordinator::CoordinatorGateway;
use crate::error::{PorterError, Result};
use crate::readers::ReaderConfig;
use crate::runtime::{DownSignal, Runner};

#[derive(Default)]
struct LeaderState {
    /// Authoritative assignment map
    tasks: AssignmentMap,
    /// Live follower names
    follower_names: HashSet<String>,
    /// Reverse index: reader unique-id to its follower
    assignment_of: HashMap<String, String>,
}

impl LeaderState {
    fn rebuild_index(&mut self) {
        self.assignment_of.clear();
        for (follower, tasks) in &self.tasks {
            for unique_id in tasks.readers.keys() {
                self.assignment_of
                    .insert(unique_id.clone(), follower.clone());
            }
        }
    }
}

/// The assignment-owning role, nested inside a follower
pub struct Leader {
    gateway: Arc<dyn CoordinatorGateway>,
    runner: Runner,
    down: DownSignal,
    token: CancellationToken,
    nonce: String,
    state: RwLock<LeaderState>,
}

impl Leader {
    pub fn new(
        parent: &CancellationToken,
        gateway: Arc<dyn CoordinatorGateway>,
        nonce: String,
    ) -> Arc<Self> {
        let token = parent.child_token();
        let down = DownSignal::new();
        let runner = Runner::new(&token, down.clone());

        Arc::new(Self {
            gateway,
            runner,
            down,
            token,
            nonce,
            state: RwLock::new(LeaderState::default()),
        })
    }

    /// Runs the role until it is stopped (or the runner gives up).
    /// Blocks the caller; the follower invokes this from its
    /// leader-watch worker after winning the leader node.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.init().await {
            // The leader node exists but the role never came up; leave
            // a clean slate for the next preemption
            let _ = self.teardown().await;
            return Err(e);
        }

        info!("leader role running");
        tokio::select! {
            _ = self.down.wait() => {}
            // The enclosing follower is tearing down; drain our own
            // workers before touching the leader node
            _ = self.token.cancelled() => self.runner.stop().await,
        }
        self.teardown().await
    }

    /// Bootstrap under the event lock so a registering follower and a
    /// starting leader never interleave half-initialized state
    async fn init(self: &Arc<Self>) -> Result<()> {
        let guard = self.gateway.lock(EVENT_LOCK_PATH).await?;

        if let Some(data) = self.gateway.get(FOLLOWER_ROOT_PATH).await? {
            if !data.is_empty() {
                let tasks: AssignmentMap =
                    serde_json::from_slice(&data).map_err(|e| PorterError::Decode {
                        message: format!("assignment map: {e}"),
                    })?;
                let mut state = self.state.write();
                state.tasks = tasks;
                state.rebuild_index();
            }
        }

        let this = self.clone();
        self.runner.run_worker("followers-watch", move |token| {
            let leader = this.clone();
            let gateway = leader.gateway.clone();
            async move {
                watch_children_loop(gateway, FOLLOWER_ROOT_PATH.to_string(), token, |children| {
                    let leader = leader.clone();
                    async move { leader.followers_changed(children).await }
                })
                .await
            }
        });

        let this = self.clone();
        self.runner.run_worker("readers-watch", move |token| {
            let leader = this.clone();
            let gateway = leader.gateway.clone();
            async move {
                watch_data_loop(gateway, READERS_PATH.to_string(), token, |data| {
                    let leader = leader.clone();
                    async move { leader.readers_changed(data).await }
                })
                .await
            }
        });

        drop(guard);
        Ok(())
    }

    /// Membership change: refresh the follower set, re-drive the
    /// assignment from the current catalog (a joiner would otherwise
    /// idle until the next catalog edit), and broadcast
    async fn followers_changed(&self, children: Vec<String>) -> Result<()> {
        self.update_follower_names(children);

        if let Some(data) = self.gateway.get(READERS_PATH).await? {
            if !data.is_empty() {
                let configs = decode_catalog(&data)?;
                self.update_assignments(configs);
            }
        }

        self.broadcast().await
    }

    /// Catalog change: merge with stable placement and broadcast
    async fn readers_changed(&self, data: Vec<u8>) -> Result<()> {
        let configs = decode_catalog(&data)?;
        self.update_assignments(configs);
        self.broadcast().await
    }

    fn update_follower_names(&self, children: Vec<String>) {
        let mut state = self.state.write();
        let names: HashSet<String> = children.into_iter().collect();

        for name in &names {
            state.tasks.entry(name.clone()).or_default();
        }

        let removed: Vec<String> = state
            .tasks
            .keys()
            .filter(|name| !names.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(tasks) = state.tasks.remove(&name) {
                debug!("follower {} left, freeing {} readers", name, tasks.readers.len());
                for unique_id in tasks.readers.keys() {
                    state.assignment_of.remove(unique_id);
                }
            }
        }

        state.follower_names = names;
    }

    /// Stable placement: vanished readers are unassigned; a reader whose
    /// previous follower survives stays put; new readers go to the
    /// follower with the fewest assignments
    fn update_assignments(&self, configs: HashMap<String, ReaderConfig>) {
        let mut state = self.state.write();

        let assigned: Vec<(String, String)> = state
            .assignment_of
            .iter()
            .map(|(id, follower)| (id.clone(), follower.clone()))
            .collect();
        for (unique_id, follower) in assigned {
            if !configs.contains_key(&unique_id) {
                if let Some(tasks) = state.tasks.get_mut(&follower) {
                    tasks.readers.remove(&unique_id);
                }
                state.assignment_of.remove(&unique_id);
            }
        }

        for (unique_id, config) in configs {
            if let Some(follower) = state.assignment_of.get(&unique_id).cloned() {
                if state.follower_names.contains(&follower) {
                    if let Some(tasks) = state.tasks.get_mut(&follower) {
                        tasks.readers.insert(unique_id, config);
                        continue;
                    }
                }
            }

            let Some(target) = state
                .tasks
                .iter()
                .min_by_key(|(_, tasks)| tasks.readers.len())
                .map(|(name, _)| name.clone())
            else {
                debug!("no followers available for reader {}", unique_id);
                continue;
            };
            if let Some(tasks) = state.tasks.get_mut(&target) {
                tasks.readers.insert(unique_id.clone(), config);
            }
            state.assignment_of.insert(unique_id, target);
        }
    }

    /// Serializes the full map to the followers root, then each
    /// follower's subset to its znode. The first write failure aborts
    /// the rest; the next membership event re-drives the broadcast.
    async fn broadcast(&self) -> Result<()> {
        let (full, subsets) = {
            let state = self.state.read();
            let full = serde_json::to_vec(&state.tasks).map_err(|e| PorterError::Decode {
                message: format!("assignment map: {e}"),
            })?;
            let mut subsets = Vec::with_capacity(state.tasks.len());
            for (name, tasks) in &state.tasks {
                let payload = serde_json::to_vec(tasks).map_err(|e| PorterError::Decode {
                    message: format!("assignment subset: {e}"),
                })?;
                subsets.push((name.clone(), payload));
            }
            (full, subsets)
        };

        self.gateway.set(FOLLOWER_ROOT_PATH, full).await?;
        for (name, payload) in subsets {
            self.gateway
                .set(&format!("{FOLLOWER_ROOT_PATH}/{name}"), payload)
                .await?;
        }

        Ok(())
    }

    /// Cancels the role's workers; `run` finishes the teardown once they
    /// have drained
    pub async fn stop(&self) {
        self.token.cancel();
        self.runner.stop().await;
    }

    /// Deletes the leader node only when it still carries this leader's
    /// nonce, so a reincarnated leader cannot delete its successor's
    /// node
    async fn teardown(&self) -> Result<()> {
        let data = match self.gateway.get(LEADER_PATH).await {
            Ok(data) => data,
            // Session gone: the ephemeral node went with it
            Err(PorterError::SessionLost) => return Ok(()),
            Err(e) => return Err(e),
        };

        if data.as_deref() == Some(self.nonce.as_bytes()) {
            info!("deleting leader node on teardown");
            self.gateway.delete(LEADER_PATH).await?;
        }

        Ok(())
    }

    /// Current assignment snapshot, for observation
    pub fn assignments(&self) -> AssignmentMap {
        self.state.read().tasks.clone()
    }
}

fn decode_catalog(data: &[u8]) -> Result<HashMap<String, ReaderConfig>> {
    let configs: Vec<ReaderConfig> = serde_json::from_slice(data).map_err(|e| {
        PorterError::Decode {
            message: format!("reader catalog: {e}"),
        }
    })?;

    Ok(configs
        .into_iter()
        .map(|config| (config.unique_id(), config))
        .collect())
}
