//! Fleet behavior over the in-process coordinator
//!
//! Boots several followers against one namespace, drives the reader
//! catalog, kills the leader, and checks the election and assignment
//! invariants end to end.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use porter_core::coordinator::{
    ensure_node, CoordinatorGateway, CoordinatorSpace, CreateMode, MemoryCoordinator,
};
use porter_core::lock::{LockStore, MemoryLockStore};
use porter_core::node::{
    AssignmentMap, Follower, FOLLOWER_ROOT_PATH, LEADER_PATH, READERS_PATH, RULES_PATH,
    WRITERS_PATH,
};
use porter_core::sinks::SinkPool;
use porter_core::sync::EmptyFilter;

async fn seed(session: &MemoryCoordinator) {
    ensure_node(session, "/porter", CreateMode::Persistent)
        .await
        .unwrap();
    for path in [FOLLOWER_ROOT_PATH, RULES_PATH, WRITERS_PATH, READERS_PATH] {
        ensure_node(session, path, CreateMode::Persistent)
            .await
            .unwrap();
    }
}

struct Node {
    follower: Arc<Follower>,
    session: Arc<MemoryCoordinator>,
    handle: tokio::task::JoinHandle<porter_core::Result<()>>,
}

fn boot(space: &Arc<CoordinatorSpace>, store: &Arc<MemoryLockStore>) -> Node {
    let session = Arc::new(space.session());
    let gateway: Arc<dyn CoordinatorGateway> = session.clone();
    let lock_store: Arc<dyn LockStore> = store.clone();

    let follower = Follower::new(
        &CancellationToken::new(),
        gateway,
        lock_store,
        Arc::new(SinkPool::new()),
        Arc::new(EmptyFilter),
        4,
    );

    let runner = follower.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    Node {
        follower,
        session,
        handle,
    }
}

async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn catalog_json(topics: &[&str]) -> Vec<u8> {
    let entries: Vec<String> = topics
        .iter()
        .map(|topic| {
            format!(
                r#"{{"type":"queue","config":{{"brokers":["b"],"group":"g","topic":"{topic}"}}}}"#
            )
        })
        .collect();
    format!("[{}]", entries.join(",")).into_bytes()
}

async fn read_assignments(observer: &MemoryCoordinator) -> AssignmentMap {
    let data = observer
        .get(FOLLOWER_ROOT_PATH)
        .await
        .unwrap()
        .unwrap_or_default();
    if data.is_empty() {
        return AssignmentMap::new();
    }
    serde_json::from_slice(&data).unwrap()
}

fn assigned_ids(map: &AssignmentMap) -> Vec<String> {
    map.values()
        .flat_map(|tasks| tasks.readers.keys().cloned())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_leader_failover_and_reassignment() {
    let space = CoordinatorSpace::new();
    let observer = space.session();
    seed(&observer).await;
    let store = MemoryLockStore::new();

    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(boot(&space, &store));
    }

    // Exactly one process wins the leader node
    wait_until("a leader to appear", || async {
        observer.get(LEADER_PATH).await.unwrap().is_some()
    })
    .await;
    wait_until("every follower to register", || async {
        let (children, _rx) = observer.watch_children(FOLLOWER_ROOT_PATH).await.unwrap();
        children.len() == 3
    })
    .await;

    wait_until("exactly one leader role", || async {
        let mut count = 0;
        for node in &nodes {
            if node.follower.is_leader().await {
                count += 1;
            }
        }
        count == 1
    })
    .await;
    let mut leader_flags = Vec::new();
    for node in &nodes {
        leader_flags.push(node.follower.is_leader().await);
    }
    let first_nonce = observer.get(LEADER_PATH).await.unwrap().unwrap();

    // Publish four readers; the union of all assignments must equal the
    // catalog, each reader exactly once
    observer
        .set(READERS_PATH, catalog_json(&["t1", "t2", "t3", "t4"]))
        .await
        .unwrap();
    wait_until("all readers to be assigned", || async {
        let ids = assigned_ids(&read_assignments(&observer).await);
        ids.len() == 4 && ids.iter().collect::<HashSet<_>>().len() == 4
    })
    .await;

    let before = read_assignments(&observer).await;

    // Kill the leader-holding process
    let leader_index = leader_flags.iter().position(|flag| *flag).unwrap();
    let dead = nodes.remove(leader_index);
    let dead_name = dead
        .follower
        .path()
        .unwrap()
        .rsplit('/')
        .next()
        .unwrap()
        .to_string();
    dead.follower.stop().await;
    let _ = dead.handle.await;
    dead.session.close();

    // Exactly one survivor takes over, with a fresh nonce
    wait_until("a new leader to appear", || async {
        match observer.get(LEADER_PATH).await.unwrap() {
            Some(nonce) => nonce != first_nonce,
            None => false,
        }
    })
    .await;
    wait_until("exactly one surviving leader", || async {
        let mut count = 0;
        for node in &nodes {
            if node.follower.is_leader().await {
                count += 1;
            }
        }
        count == 1
    })
    .await;

    // The dead follower's readers are reassigned; survivors' stable
    // assignments stay in place
    wait_until("readers to be reassigned to survivors", || async {
        let map = read_assignments(&observer).await;
        if map.contains_key(&dead_name) {
            return false;
        }
        let ids = assigned_ids(&map);
        ids.len() == 4 && ids.iter().collect::<HashSet<_>>().len() == 4
    })
    .await;

    let after = read_assignments(&observer).await;
    for (follower, tasks) in &before {
        if follower == &dead_name {
            continue;
        }
        for unique_id in tasks.readers.keys() {
            assert!(
                after[follower].readers.contains_key(unique_id),
                "stable placement must keep {unique_id} on {follower}"
            );
        }
    }

    for node in nodes {
        node.follower.stop().await;
        let _ = node.handle.await;
        node.session.close();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_follower_join_receives_work() {
    let space = CoordinatorSpace::new();
    let observer = space.session();
    seed(&observer).await;
    let store = MemoryLockStore::new();

    let first = boot(&space, &store);
    wait_until("a leader to appear", || async {
        observer.get(LEADER_PATH).await.unwrap().is_some()
    })
    .await;

    observer
        .set(READERS_PATH, catalog_json(&["t1", "t2"]))
        .await
        .unwrap();
    wait_until("initial assignment", || async {
        assigned_ids(&read_assignments(&observer).await).len() == 2
    })
    .await;

    // A joiner triggers a rebalance-and-broadcast even without catalog
    // changes: its empty record must appear in the assignment map
    let second = boot(&space, &store);
    wait_until("joiner to appear in the broadcast", || async {
        let map = read_assignments(&observer).await;
        map.len() == 2 && assigned_ids(&map).len() == 2
    })
    .await;

    for node in [first, second] {
        node.follower.stop().await;
        let _ = node.handle.await;
        node.session.close();
    }
}
