//! Cluster roles
//!
//! Every process runs the follower role; one of them additionally holds
//! the leader role and assigns readers. Both roles are driven by
//! single-shot coordinator watches that re-register after every
//! delivery; a watch loop that cannot re-register fails by panicking,
//! which is the supervised runtime's restart signal.

pub mod follower;
pub mod leader;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::coordinator::{CoordinatorGateway, NodeEvent};
use crate::readers::ReaderConfig;

pub use follower::Follower;
pub use leader::Leader;

pub const LEADER_PATH: &str = "/porter/leader";
pub const FOLLOWER_ROOT_PATH: &str = "/porter/followers";
pub const RULES_PATH: &str = "/porter/rules";
pub const WRITERS_PATH: &str = "/porter/writers";
pub const READERS_PATH: &str = "/porter/readers";
pub const EVENT_LOCK_PATH: &str = "/porter/event-lock";

/// Reader workload of one follower, as stored in its znode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowerTasks {
    #[serde(default)]
    pub readers: HashMap<String, ReaderConfig>,
}

/// Full assignment map, follower name to its workload, as stored at the
/// followers root
pub type AssignmentMap = HashMap<String, FollowerTasks>;

/// Watches a node's data: applies the current content, then re-registers
/// after every delivery and applies the fresh content. The first apply
/// failure panics (bad state at startup); later failures are logged and
/// the loop keeps watching.
pub(crate) async fn watch_data_loop<F, Fut>(
    gateway: Arc<dyn CoordinatorGateway>,
    path: String,
    token: CancellationToken,
    apply: F,
) where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = crate::error::Result<()>>,
{
    let mut first = true;

    loop {
        let (data, rx) = match gateway.watch_data(&path).await {
            Ok(watch) => watch,
            Err(e) => panic!("watch {path} data failed: {e}"),
        };

        if let Some(data) = data {
            if !data.is_empty() {
                if let Err(e) = apply(data).await {
                    if first {
                        panic!("initial apply of {path} failed: {e}");
                    }
                    error!("apply of {} data failed: {}", path, e);
                }
            }
        }
        first = false;

        tokio::select! {
            event = rx => match event {
                Ok(NodeEvent::SessionLost) | Err(_) => panic!("session lost watching {path}"),
                // Deliveries are processed in order; loop back to
                // re-register and read the latest data
                Ok(_) => {}
            },
            _ = token.cancelled() => return,
        }
    }
}

/// Watches a node's children with the same re-registration discipline.
/// Apply failures panic: membership reactions must not be silently
/// dropped, and the restarted loop re-drives them.
pub(crate) async fn watch_children_loop<F, Fut>(
    gateway: Arc<dyn CoordinatorGateway>,
    path: String,
    token: CancellationToken,
    apply: F,
) where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = crate::error::Result<()>>,
{
    loop {
        let (children, rx) = match gateway.watch_children(&path).await {
            Ok(watch) => watch,
            Err(e) => panic!("watch {path} children failed: {e}"),
        };

        if let Err(e) = apply(children).await {
            panic!("apply of {path} children failed: {e}");
        }

        tokio::select! {
            event = rx => match event {
                Ok(NodeEvent::SessionLost) | Err(_) => panic!("session lost watching {path}"),
                Ok(_) => {}
            },
            _ = token.cancelled() => return,
        }
    }
}
