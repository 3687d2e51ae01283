//! Dispatcher fan-out and acknowledgement decisions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use porter_core::error::{PorterError, Result};
use porter_core::event::ChangeEvent;
use porter_core::lock::{LockStore, MemoryLockStore};
use porter_core::rules::SyncRule;
use porter_core::sinks::{Sink, SinkEndpoint, SinkPool};
use porter_core::sync::dispatcher::SharedRules;
use porter_core::sync::{Dispatcher, EmptyFilter, SinkValues, SyncHandler, SyncTask};

#[derive(Default)]
struct CountingSink {
    writes: Mutex<usize>,
}

#[async_trait]
impl Sink for CountingSink {
    async fn insert(&self, _task: &SyncTask, _values: SinkValues) -> Result<()> {
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn update(&self, _task: &SyncTask, _values: SinkValues) -> Result<()> {
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn delete(&self, _task: &SyncTask) -> Result<()> {
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn set_endpoints(&self, _endpoints: HashMap<String, SinkEndpoint>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

async fn dispatcher_with_pool_size(pool_size: usize) -> (Arc<Dispatcher>, Arc<CountingSink>) {
    let sink = Arc::new(CountingSink::default());

    let mut pool = SinkPool::empty();
    let registered = sink.clone();
    pool.register("table", move || {
        let sink: Arc<dyn Sink> = registered.clone();
        sink
    });
    let pool = Arc::new(pool);
    pool.set_configs(HashMap::from([(
        "table".to_string(),
        HashMap::from([(
            "sink".to_string(),
            SinkEndpoint {
                host: "localhost".into(),
                port: 3306,
                username: None,
                password: None,
                database: None,
            },
        )]),
    )]))
    .await
    .unwrap();

    let rule: SyncRule = serde_json::from_str(
        r#"{"database":"t","table":"u","primary_key":"id",
            "columns":{"id":"id"},"target":"table:sink.t.u","sync_type":"copy"}"#,
    )
    .unwrap();
    let rules: SharedRules = Arc::new(parking_lot::RwLock::new(HashMap::from([(
        rule.rule_key(),
        vec![Arc::new(rule)],
    )])));

    let store: Arc<dyn LockStore> = MemoryLockStore::new();
    let handler = Arc::new(SyncHandler::new(store, pool, Arc::new(EmptyFilter)));

    (Dispatcher::new(handler, rules, pool_size), sink)
}

fn event(raw: &str) -> Arc<ChangeEvent> {
    Arc::new(serde_json::from_str(raw).unwrap())
}

/// Property 12: submit saturation records an error on the batch instead
/// of blocking, and the event stays unacknowledged
#[tokio::test]
async fn test_saturation_records_error_without_blocking() {
    // One worker, channel capacity one: a three-row event overflows
    // before the worker gets scheduled on the current-thread runtime
    let (dispatcher, sink) = dispatcher_with_pool_size(1).await;

    let outcome = dispatcher
        .dispatch(event(
            r#"{"event_id":"e1","database":"t","table":"u","ts":1,
                "type":"INSERT",
                "data":[{"id":"1"},{"id":"2"},{"id":"3"}]}"#,
        ))
        .await;

    assert!(matches!(outcome, Err(PorterError::PoolSaturated)));
    // The row that made it into the channel was still applied
    assert_eq!(*sink.writes.lock(), 1);
}

/// An event matching no rule group is acknowledged: nothing to do is
/// not an error
#[tokio::test]
async fn test_absent_rules_acknowledge() {
    let (dispatcher, sink) = dispatcher_with_pool_size(4).await;

    let outcome = dispatcher
        .dispatch(event(
            r#"{"event_id":"e2","database":"t","table":"unknown","ts":1,
                "type":"INSERT","data":[{"id":"1"}]}"#,
        ))
        .await;

    assert!(outcome.is_ok());
    assert_eq!(*sink.writes.lock(), 0);
}

/// Invariant 1: every matching rule × row produces exactly one sink call
/// for an acknowledged event
#[tokio::test]
async fn test_every_row_applied_once() {
    let (dispatcher, sink) = dispatcher_with_pool_size(8).await;

    let outcome = dispatcher
        .dispatch(event(
            r#"{"event_id":"e3","database":"t","table":"u","ts":1,
                "type":"INSERT",
                "data":[{"id":"1"},{"id":"2"},{"id":"3"},{"id":"4"}]}"#,
        ))
        .await;

    assert!(outcome.is_ok());
    assert_eq!(*sink.writes.lock(), 4);
}

/// Batches are independent: a saturated batch does not poison the next
#[tokio::test]
async fn test_dispatch_recovers_after_saturation() {
    let (dispatcher, sink) = dispatcher_with_pool_size(1).await;

    let _ = dispatcher
        .dispatch(event(
            r#"{"event_id":"e4","database":"t","table":"u","ts":1,
                "type":"INSERT","data":[{"id":"1"},{"id":"2"},{"id":"3"}]}"#,
        ))
        .await;

    let outcome = dispatcher
        .dispatch(event(
            r#"{"event_id":"e5","database":"t","table":"u","ts":1,
                "type":"INSERT","data":[{"id":"9"}]}"#,
        ))
        .await;

    assert!(outcome.is_ok());
    assert_eq!(*sink.writes.lock(), 2);
}
