//! HTTP push reader
//!
//! Embeds an HTTP server; one endpoint accepts change-event JSON bodies
//! and hands them to a bounded channel with a per-request timeout.
//! 202 on enqueue, 408 on timeout, 500 during shutdown, 400 on a
//! malformed body. Completion is a no-op: push sources are
//! fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{hash_id, Reader, ReaderConfig, ReaderCore};
use crate::error::{PorterError, Result};
use crate::event::ChangeEvent;

fn default_buffer() -> usize {
    10
}

fn default_push_timeout_ms() -> u64 {
    1_000
}

/// Configuration of one HTTP push reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReaderConfig {
    /// Bind address, e.g. `0.0.0.0:8044`
    pub listen: String,
    /// Path accepting POSTed change events
    pub push_path: String,
    /// Pending-event channel capacity
    #[serde(default = "default_buffer")]
    pub buffer: usize,
    /// How long one request may wait for channel space
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

impl HttpReaderConfig {
    pub fn unique_id(&self) -> String {
        hash_id(&format!("{}-{}", self.listen, self.push_path))
    }
}

struct PushState {
    tx: mpsc::Sender<ChangeEvent>,
    token: CancellationToken,
    timeout: Duration,
}

/// Reader fed by an embedded HTTP endpoint
pub struct HttpReader {
    core: ReaderCore,
    rx: tokio::sync::Mutex<mpsc::Receiver<ChangeEvent>>,
    local_addr: std::net::SocketAddr,
}

impl HttpReader {
    /// Binds the server and starts serving pushes
    pub async fn bind(config: HttpReaderConfig, parent: &CancellationToken) -> Result<Arc<Self>> {
        let core = ReaderCore::new(ReaderConfig::Http(config.clone()), parent);
        let (tx, rx) = mpsc::channel(config.buffer.max(1));

        let path = if config.push_path.starts_with('/') {
            config.push_path.clone()
        } else {
            format!("/{}", config.push_path)
        };
        let state = Arc::new(PushState {
            tx,
            token: core.token(),
            timeout: Duration::from_millis(config.push_timeout_ms),
        });

        let listener =
            tokio::net::TcpListener::bind(&config.listen)
                .await
                .map_err(|e| PorterError::Reader {
                    message: format!("bind {} failed: {e}", config.listen),
                })?;
        let local_addr = listener.local_addr().map_err(|e| PorterError::Reader {
            message: format!("local addr: {e}"),
        })?;
        info!("http reader listening on {}{}", local_addr, path);

        let app = Router::new().route(&path, post(accept_event)).with_state(state);
        let shutdown = core.token();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!("http reader server error: {}", e);
            }
        });

        Ok(Arc::new(Self {
            core,
            rx: tokio::sync::Mutex::new(rx),
            local_addr,
        }))
    }

    /// Address the embedded server actually bound (port 0 resolves here)
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

async fn accept_event(
    State(state): State<Arc<PushState>>,
    payload: std::result::Result<Json<ChangeEvent>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(event) = match payload {
        Ok(event) => event,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": 400, "message": rejection.body_text()})),
            );
        }
    };

    tokio::select! {
        _ = state.token.cancelled() => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": 500, "message": "service closed"})),
        ),
        sent = state.tx.send_timeout(event, state.timeout) => match sent {
            Ok(()) => (StatusCode::ACCEPTED, Json(json!({"code": 202}))),
            Err(SendTimeoutError::Timeout(_)) => (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({"code": 408, "message": "timeout"})),
            ),
            Err(SendTimeoutError::Closed(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": 500, "message": "service closed"})),
            ),
        },
    }
}

#[async_trait]
impl Reader for HttpReader {
    async fn read(&self) -> Result<Option<ChangeEvent>> {
        let mut rx = self.rx.lock().await;
        let token = self.core.token();
        tokio::select! {
            _ = token.cancelled() => Ok(None),
            event = rx.recv() => Ok(event),
        }
    }

    async fn complete(&self, _event: &ChangeEvent) -> Result<()> {
        // Push sources have nothing to acknowledge
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.core.first_close() {
            info!("http reader closed");
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
