//! Change-event sources
//!
//! A reader pulls change events from one upstream source and
//! acknowledges them after the dispatcher has applied them. Configs are
//! tagged by reader kind; the unique id is a hash of the identifying
//! fields, so the leader can assign the same source to the same
//! follower across catalog updates.

pub mod http;
pub mod queue;

use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::ChangeEvent;

pub use http::{HttpReader, HttpReaderConfig};
pub use queue::{MemoryQueue, QueueConsumer, QueueMessage, QueueReader, QueueReaderConfig};

/// Reader configuration tagged by kind, as carried in the reader
/// catalog and assignment maps. Two configs are equal iff all
/// identifying fields match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum ReaderConfig {
    Http(HttpReaderConfig),
    Queue(QueueReaderConfig),
}

impl ReaderConfig {
    /// Deterministic id derived from the identifying fields
    pub fn unique_id(&self) -> String {
        match self {
            ReaderConfig::Http(config) => config.unique_id(),
            ReaderConfig::Queue(config) => config.unique_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReaderConfig::Http(_) => "http",
            ReaderConfig::Queue(_) => "queue",
        }
    }
}

/// FNV-1a hex digest of the identifying fields
pub(crate) fn hash_id(source: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(source.as_bytes());
    format!("{:x}", hasher.finish())
}

/// Pull-model source of change events
#[async_trait]
pub trait Reader: Send + Sync {
    /// Next event. `Ok(None)` means the source is exhausted or the
    /// reader was closed; the listen loop exits cleanly. Errors are
    /// transient and the loop continues.
    async fn read(&self) -> Result<Option<ChangeEvent>>;

    /// Acknowledges the event upstream. At most once per event.
    async fn complete(&self, event: &ChangeEvent) -> Result<()>;

    /// Tears the reader down. Idempotent: the first caller cancels and
    /// closes, later callers succeed silently.
    async fn close(&self) -> Result<()>;

    /// Config this reader was built from
    fn config(&self) -> &ReaderConfig;

    /// Reader-scoped cancellation token
    fn token(&self) -> CancellationToken;
}

/// Shared reader plumbing: config, nested cancellation scope, and
/// first-close latching
pub(crate) struct ReaderCore {
    config: ReaderConfig,
    token: CancellationToken,
    closed: AtomicBool,
}

impl ReaderCore {
    pub(crate) fn new(config: ReaderConfig, parent: &CancellationToken) -> Self {
        Self {
            config,
            token: parent.child_token(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True for exactly the first caller; cancels the reader scope
    pub(crate) fn first_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }
}

type QueueConnector =
    Arc<dyn Fn(&QueueReaderConfig) -> Result<Arc<dyn QueueConsumer>> + Send + Sync>;

/// Builds readers from assigned configs. The queue connector is the
/// seam where a real consumer-group client plugs in; the default wires
/// an in-process queue.
#[derive(Clone)]
pub struct ReaderFactory {
    parent: CancellationToken,
    queue_connector: QueueConnector,
}

impl ReaderFactory {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            queue_connector: Arc::new(|config| {
                let consumer: Arc<dyn QueueConsumer> = MemoryQueue::new(config.queue_capacity);
                Ok(consumer)
            }),
        }
    }

    /// Replaces the consumer-group connector
    pub fn with_queue_connector<F>(mut self, connector: F) -> Self
    where
        F: Fn(&QueueReaderConfig) -> Result<Arc<dyn QueueConsumer>> + Send + Sync + 'static,
    {
        self.queue_connector = Arc::new(connector);
        self
    }

    /// Constructs and starts a reader for `config`
    pub async fn build(&self, config: ReaderConfig) -> Result<Arc<dyn Reader>> {
        match config {
            ReaderConfig::Http(http) => {
                let reader: Arc<dyn Reader> = HttpReader::bind(http, &self.parent).await?;
                Ok(reader)
            }
            ReaderConfig::Queue(queue) => {
                let consumer = (self.queue_connector)(&queue)?;
                let reader: Arc<dyn Reader> = QueueReader::new(queue, consumer, &self.parent);
                Ok(reader)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let raw = r#"{"type":"queue","config":{"brokers":["localhost:9092"],
            "group":"g1","topic":"events","partition":0}}"#;
        let config: ReaderConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.kind(), "queue");
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ReaderConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
        assert_eq!(config.unique_id(), decoded.unique_id());
    }

    #[test]
    fn test_unique_id_tracks_identifying_fields() {
        let base: ReaderConfig = serde_json::from_str(
            r#"{"type":"queue","config":{"brokers":["b1"],"group":"g","topic":"t"}}"#,
        )
        .unwrap();
        let same: ReaderConfig = serde_json::from_str(
            r#"{"type":"queue","config":{"brokers":["b1"],"group":"g","topic":"t"}}"#,
        )
        .unwrap();
        let other: ReaderConfig = serde_json::from_str(
            r#"{"type":"queue","config":{"brokers":["b1"],"group":"g","topic":"t2"}}"#,
        )
        .unwrap();

        assert_eq!(base.unique_id(), same.unique_id());
        assert_ne!(base.unique_id(), other.unique_id());
    }
}
