//! Error types for Porter
//!
//! Comprehensive error taxonomy covering configuration, coordination,
//! record locking, readers, sinks, and the sync pipeline.

use thiserror::Error;

/// Primary error type for all Porter operations
#[derive(Debug, Error)]
pub enum PorterError {
    // ========== Configuration Errors ==========

    /// Configuration could not be loaded or validated
    #[error("Config error: {message}")]
    Config { message: String },

    /// Rule target string does not match `<kind>:<instance>.<db>.<table>`
    #[error("Invalid rule target: {target}")]
    InvalidTarget { target: String },

    // ========== Coordinator Errors ==========

    /// Node does not exist
    #[error("Node not found: {path}")]
    NoNode { path: String },

    /// Node already exists (e.g. a competing leader won the race)
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// Coordinator session was lost; fatal to the affected workers
    #[error("Coordinator session lost")]
    SessionLost,

    /// Other coordinator failure
    #[error("Coordinator error: {message}")]
    Coordinator { message: String },

    // ========== Record Lock Errors ==========

    /// Record mutex could not be acquired within the retry budget
    #[error("Record lock unavailable: {key}")]
    LockUnavailable { key: String },

    // ========== Reader Errors ==========

    /// Reader failed transiently; the event will be redelivered
    #[error("Reader error: {message}")]
    Reader { message: String },

    /// Incoming payload could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    // ========== Sink Errors ==========

    /// No sink registered for the requested kind
    #[error("Sink kind not registered: {kind}")]
    SinkNotFound { kind: String },

    /// No endpoint configured for the requested instance
    #[error("Sink instance not configured: {instance}")]
    SinkInstanceNotFound { instance: String },

    /// Sink does not support the rule's sync mode
    #[error("Sink {kind} does not support {mode} mode")]
    SinkModeUnsupported { kind: String, mode: String },

    /// Sink write failed transiently
    #[error("Sink error: {message}")]
    Sink { message: String },

    // ========== Sync Pipeline Errors ==========

    /// Worker pool rejected the task (saturated)
    #[error("Worker pool saturated")]
    PoolSaturated,

    /// A per-row task panicked; converted to a batch error
    #[error("Task panicked: {message}")]
    TaskPanicked { message: String },

    // ========== Runtime Errors ==========

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PorterError {
    /// Returns true if this error is expected to clear on redelivery
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PorterError::Reader { .. }
                | PorterError::Sink { .. }
                | PorterError::Coordinator { .. }
                | PorterError::PoolSaturated
        )
    }

    /// Returns true if this error must tear the process down
    pub fn is_fatal(&self) -> bool {
        matches!(self, PorterError::SessionLost)
    }
}

/// Result type alias for Porter operations
pub type Result<T> = std::result::Result<T, PorterError>;
