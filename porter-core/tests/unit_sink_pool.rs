//! Sink pool reconciliation semantics

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use porter_core::error::{PorterError, Result};
use porter_core::sinks::{Sink, SinkEndpoint, SinkPool};
use porter_core::sync::{SinkValues, SyncTask};

#[derive(Default)]
struct ProbeSink {
    endpoint_updates: Mutex<Vec<Vec<String>>>,
    closed: AtomicUsize,
}

#[async_trait]
impl Sink for ProbeSink {
    async fn insert(&self, _task: &SyncTask, _values: SinkValues) -> Result<()> {
        Ok(())
    }

    async fn update(&self, _task: &SyncTask, _values: SinkValues) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _task: &SyncTask) -> Result<()> {
        Ok(())
    }

    async fn set_endpoints(&self, endpoints: HashMap<String, SinkEndpoint>) -> Result<()> {
        let mut names: Vec<String> = endpoints.keys().cloned().collect();
        names.sort();
        self.endpoint_updates.lock().push(names);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn endpoint(host: &str) -> SinkEndpoint {
    SinkEndpoint {
        host: host.into(),
        port: 9200,
        username: None,
        password: None,
        database: None,
    }
}

fn pool_with(probe: Arc<ProbeSink>) -> SinkPool {
    let mut pool = SinkPool::empty();
    pool.register("probe", move || {
        let sink: Arc<dyn Sink> = probe.clone();
        sink
    });
    pool
}

#[tokio::test]
async fn test_new_kind_installs_and_receives_endpoints() {
    let probe = Arc::new(ProbeSink::default());
    let pool = pool_with(probe.clone());

    pool.set_configs(HashMap::from([(
        "probe".to_string(),
        HashMap::from([("main".to_string(), endpoint("a"))]),
    )]))
    .await
    .unwrap();

    assert!(pool.get("probe").await.is_ok());
    assert_eq!(
        probe.endpoint_updates.lock().as_slice(),
        &[vec!["main".to_string()]]
    );
}

#[tokio::test]
async fn test_removed_kind_is_closed_and_dropped() {
    let probe = Arc::new(ProbeSink::default());
    let pool = pool_with(probe.clone());

    pool.set_configs(HashMap::from([(
        "probe".to_string(),
        HashMap::from([("main".to_string(), endpoint("a"))]),
    )]))
    .await
    .unwrap();

    pool.set_configs(HashMap::new()).await.unwrap();

    assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        pool.get("probe").await,
        Err(PorterError::SinkNotFound { .. })
    ));
}

#[tokio::test]
async fn test_unregistered_kind_is_reported_last() {
    let probe = Arc::new(ProbeSink::default());
    let pool = pool_with(probe.clone());

    let outcome = pool
        .set_configs(HashMap::from([
            (
                "probe".to_string(),
                HashMap::from([("main".to_string(), endpoint("a"))]),
            ),
            (
                "bogus".to_string(),
                HashMap::from([("main".to_string(), endpoint("a"))]),
            ),
        ]))
        .await;

    // The registered kind was still installed
    assert!(matches!(outcome, Err(PorterError::SinkNotFound { .. })));
    assert!(pool.get("probe").await.is_ok());
}

#[tokio::test]
async fn test_release_closes_everything() {
    let probe = Arc::new(ProbeSink::default());
    let pool = pool_with(probe.clone());

    pool.set_configs(HashMap::from([(
        "probe".to_string(),
        HashMap::from([("main".to_string(), endpoint("a"))]),
    )]))
    .await
    .unwrap();

    pool.release().await;
    assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
    assert!(pool.get("probe").await.is_err());
}
