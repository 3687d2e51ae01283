//! Sink writers
//!
//! A sink applies per-row changes to one downstream store family. The
//! pool owns one sink per kind, pushes endpoint configuration diffs into
//! them, and hands sinks out to the state machine by kind.

pub mod search;
pub mod table;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{PorterError, Result};
use crate::sync::task::{SinkValues, SyncTask};

pub use search::SearchSink;
pub use table::TableSink;

/// Sink kind tag for tabular stores
pub const SINK_KIND_TABLE: &str = "table";
/// Sink kind tag for the search-index family
pub const SINK_KIND_SEARCH: &str = "search";

/// Connection endpoint for one sink instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Target database for tabular stores; unused by search indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// A typed destination for applied changes
#[async_trait]
pub trait Sink: Send + Sync {
    async fn insert(&self, task: &SyncTask, values: SinkValues) -> Result<()>;
    async fn update(&self, task: &SyncTask, values: SinkValues) -> Result<()>;
    async fn delete(&self, task: &SyncTask) -> Result<()>;

    /// Replaces the instance/endpoint map. Structurally equal endpoints
    /// keep their connection; changed or removed ones are closed and
    /// rebuilt lazily on next use.
    async fn set_endpoints(&self, endpoints: HashMap<String, SinkEndpoint>) -> Result<()>;

    /// Closes every open connection
    async fn close(&self);
}

type SinkConstructor = Box<dyn Fn() -> Arc<dyn Sink> + Send + Sync>;

/// Registry of sink instances keyed by sink kind
pub struct SinkPool {
    constructors: HashMap<String, SinkConstructor>,
    sinks: tokio::sync::RwLock<HashMap<String, Arc<dyn Sink>>>,
}

impl SinkPool {
    /// Pool with the built-in sink kinds registered
    pub fn new() -> Self {
        let mut pool = Self::empty();
        pool.register(SINK_KIND_TABLE, || Arc::new(TableSink::new()));
        pool.register(SINK_KIND_SEARCH, || Arc::new(SearchSink::new()));
        pool
    }

    /// Pool with no registered kinds
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
            sinks: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Registers a constructor for a sink kind. Kinds are fixed at
    /// startup; only instances and endpoints change at runtime.
    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Sink> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Box::new(constructor));
    }

    /// Applies a full sink configuration: new kinds are instantiated,
    /// removed kinds are closed and dropped, and each surviving kind
    /// diffs its instance endpoints. The last error wins; earlier ones
    /// are logged.
    pub async fn set_configs(
        &self,
        configs: HashMap<String, HashMap<String, SinkEndpoint>>,
    ) -> Result<()> {
        let mut sinks = self.sinks.write().await;
        let mut last_err = None;

        for (kind, endpoints) in &configs {
            let sink = match sinks.get(kind) {
                Some(sink) => sink.clone(),
                None => match self.constructors.get(kind) {
                    Some(constructor) => {
                        info!("installing sink kind {}", kind);
                        let sink = constructor();
                        sinks.insert(kind.clone(), sink.clone());
                        sink
                    }
                    None => {
                        error!("no sink constructor registered for {}", kind);
                        last_err = Some(PorterError::SinkNotFound { kind: kind.clone() });
                        continue;
                    }
                },
            };

            if let Err(e) = sink.set_endpoints(endpoints.clone()).await {
                error!("sink {} endpoint update failed: {}", kind, e);
                last_err = Some(e);
            }
        }

        let removed: Vec<String> = sinks
            .keys()
            .filter(|kind| !configs.contains_key(*kind))
            .cloned()
            .collect();
        for kind in removed {
            info!("removing sink kind {}", kind);
            if let Some(sink) = sinks.remove(&kind) {
                sink.close().await;
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves the sink for a kind
    pub async fn get(&self, kind: &str) -> Result<Arc<dyn Sink>> {
        let sinks = self.sinks.read().await;
        sinks
            .get(kind)
            .cloned()
            .ok_or_else(|| PorterError::SinkNotFound {
                kind: kind.to_string(),
            })
    }

    /// Closes every sink; used at process shutdown
    pub async fn release(&self) {
        let mut sinks = self.sinks.write().await;
        for (_, sink) in sinks.drain() {
            sink.close().await;
        }
    }
}

impl Default for SinkPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance connection cache shared by the sink implementations:
/// endpoint configs on one side, lazily opened clients on the other,
/// with double-checked creation.
pub(crate) struct ClientPool<T> {
    endpoints: parking_lot::RwLock<HashMap<String, SinkEndpoint>>,
    clients: tokio::sync::RwLock<HashMap<String, Arc<T>>>,
}

impl<T> ClientPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            endpoints: parking_lot::RwLock::new(HashMap::new()),
            clients: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Installs a new endpoint map and evicts clients whose endpoint
    /// changed or disappeared. Returns the evicted clients so the caller
    /// can close them.
    pub(crate) async fn set_endpoints(
        &self,
        new_endpoints: HashMap<String, SinkEndpoint>,
    ) -> Vec<Arc<T>> {
        let stale: Vec<String> = {
            let current = self.endpoints.read();
            current
                .iter()
                .filter(|(name, endpoint)| new_endpoints.get(*name) != Some(endpoint))
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut evicted = Vec::new();
        {
            let mut clients = self.clients.write().await;
            for name in &stale {
                if let Some(client) = clients.remove(name) {
                    evicted.push(client);
                }
            }
        }
        *self.endpoints.write() = new_endpoints;

        evicted
    }

    /// Drops all clients, returning them for closing
    pub(crate) async fn drain(&self) -> Vec<Arc<T>> {
        self.endpoints.write().clear();
        let mut clients = self.clients.write().await;
        clients.drain().map(|(_, client)| client).collect()
    }

    /// Fetches the instance's client, opening it on first use. Creation
    /// is double-checked so concurrent callers share one connection.
    pub(crate) async fn get_or_connect<F, Fut>(&self, instance: &str, connect: F) -> Result<Arc<T>>
    where
        F: FnOnce(SinkEndpoint) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(instance) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(instance) {
            return Ok(client.clone());
        }

        let endpoint = {
            let endpoints = self.endpoints.read();
            endpoints
                .get(instance)
                .cloned()
                .ok_or_else(|| PorterError::SinkInstanceNotFound {
                    instance: instance.to_string(),
                })?
        };

        let client = Arc::new(connect(endpoint).await?);
        clients.insert(instance.to_string(), client.clone());

        Ok(client)
    }
}
