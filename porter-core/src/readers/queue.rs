//! Pull-queue reader
//!
//! Fetches change events from a consumer group, remembering each
//! message's offset in the event's source handle; completion commits
//! the offset. The consumer-group wire client lives behind
//! [`QueueConsumer`]; an in-process queue ships for tests and
//! single-node loopback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{hash_id, Reader, ReaderConfig, ReaderCore};
use crate::error::{PorterError, Result};
use crate::event::{ChangeEvent, SourceHandle};

fn default_group() -> String {
    "porter".to_string()
}

fn default_queue_capacity() -> usize {
    1_000
}

/// Configuration of one pull-queue reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueReaderConfig {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_group")]
    pub group: String,
    pub topic: String,
    #[serde(default)]
    pub partition: i32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl QueueReaderConfig {
    pub fn unique_id(&self) -> String {
        hash_id(&format!(
            "{}-{}-{}-{}-{}-{}",
            self.brokers.join("-"),
            self.username.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
            self.group,
            self.topic,
            self.partition
        ))
    }
}

/// One fetched message before decoding
pub struct QueueMessage {
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// Consumer-group client seam
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Next message; `Ok(None)` when the source is definitively
    /// exhausted
    async fn fetch(&self) -> Result<Option<QueueMessage>>;

    /// Commits one consumed offset
    async fn commit(&self, partition: i32, offset: i64) -> Result<()>;

    async fn close(&self);
}

/// Reader over a [`QueueConsumer`]
pub struct QueueReader {
    core: ReaderCore,
    consumer: Arc<dyn QueueConsumer>,
}

impl QueueReader {
    pub fn new(
        config: QueueReaderConfig,
        consumer: Arc<dyn QueueConsumer>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: ReaderCore::new(ReaderConfig::Queue(config), parent),
            consumer,
        })
    }
}

#[async_trait]
impl Reader for QueueReader {
    async fn read(&self) -> Result<Option<ChangeEvent>> {
        let token = self.core.token();
        let message = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            message = self.consumer.fetch() => message?,
        };
        let Some(message) = message else {
            return Ok(None);
        };

        let mut event: ChangeEvent =
            serde_json::from_slice(&message.payload).map_err(|e| PorterError::Decode {
                message: format!("queue payload: {e}"),
            })?;
        event.source = SourceHandle::Queue {
            partition: message.partition,
            offset: message.offset,
        };

        Ok(Some(event))
    }

    async fn complete(&self, event: &ChangeEvent) -> Result<()> {
        match event.source {
            SourceHandle::Queue { partition, offset } => {
                self.consumer.commit(partition, offset).await
            }
            SourceHandle::None => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.core.first_close() {
            self.consumer.close().await;
            info!("queue reader closed");
        }
        Ok(())
    }

    fn config(&self) -> &ReaderConfig {
        self.core.config()
    }

    fn token(&self) -> CancellationToken {
        self.core.token()
    }
}

/// In-process queue with offset bookkeeping
pub struct MemoryQueue {
    tx: Mutex<Option<mpsc::Sender<QueueMessage>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueueMessage>>,
    committed: Mutex<HashMap<i32, i64>>,
    next_offset: AtomicI64,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            committed: Mutex::new(HashMap::new()),
            next_offset: AtomicI64::new(0),
        })
    }

    /// Enqueues one payload on partition 0, returning its offset
    pub async fn push(&self, payload: Vec<u8>) -> Result<i64> {
        let tx = {
            let guard = self.tx.lock();
            guard.clone()
        };
        let tx = tx.ok_or_else(|| PorterError::Reader {
            message: "memory queue input closed".to_string(),
        })?;

        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        tx.send(QueueMessage {
            payload,
            partition: 0,
            offset,
        })
        .await
        .map_err(|_| PorterError::Reader {
            message: "memory queue closed".to_string(),
        })?;

        Ok(offset)
    }

    /// Closes the producer side; fetch drains then reports EOF
    pub fn end_input(&self) {
        self.tx.lock().take();
    }

    /// Highest committed offset per partition
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.committed.lock().get(&partition).copied()
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn fetch(&self) -> Result<Option<QueueMessage>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        let mut committed = self.committed.lock();
        let entry = committed.entry(partition).or_insert(-1);
        if offset > *entry {
            *entry = offset;
        }
        Ok(())
    }

    async fn close(&self) {
        self.end_input();
    }
}
