//! Change-data events
//!
//! One event carries the row changes produced by a single upstream
//! statement: post-images in `data`, pre-images (changed columns only)
//! in `old`, aligned by index.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// A single row image, column name to value. All values are strings on
/// the wire.
pub type Row = HashMap<String, String>;

/// Kind of a change event, normalized to lowercase on decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "insert" => Some(EventKind::Insert),
            "update" => Some(EventKind::Update),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "insert",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

/// Opaque handle used to acknowledge an event back to its reader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceHandle {
    /// No acknowledgement state (push sources)
    #[default]
    None,
    /// Consumer-group offset to commit on completion
    Queue { partition: i32, offset: i64 },
}

/// One ingested change-data message
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Unique event id
    pub event_id: String,
    /// Source database name
    pub database: String,
    /// Source table name
    pub table: String,
    /// Event timestamp (epoch millis as delivered upstream)
    pub ts: i64,
    /// Normalized event kind
    pub kind: EventKind,
    /// DDL events are acknowledged without applying
    pub is_ddl: bool,
    /// Post-images, one per affected row
    pub data: Vec<Row>,
    /// Pre-images aligned with `data`; may be shorter
    pub old: Vec<Row>,
    /// Handle for acknowledging the message upstream
    pub source: SourceHandle,
}

#[derive(Deserialize)]
struct WireEvent {
    event_id: String,
    database: String,
    table: String,
    ts: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "isDdl", default)]
    is_ddl: bool,
    data: Vec<Row>,
    #[serde(default)]
    old: Option<Vec<Row>>,
}

impl<'de> Deserialize<'de> for ChangeEvent {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireEvent::deserialize(deserializer)?;
        let kind = EventKind::parse(&wire.kind)
            .ok_or_else(|| D::Error::custom(format!("unknown event type {:?}", wire.kind)))?;

        Ok(ChangeEvent {
            event_id: wire.event_id,
            database: wire.database,
            table: wire.table,
            ts: wire.ts,
            kind,
            is_ddl: wire.is_ddl,
            data: wire.data,
            old: wire.old.unwrap_or_default(),
            source: SourceHandle::None,
        })
    }
}

impl ChangeEvent {
    /// Key used to look up the rule group for this event
    pub fn rule_key(&self) -> String {
        format!("{}_{}", self.database, self.table)
    }

    /// Pre-image for row `i`, if one was delivered
    pub fn pre_image(&self, i: usize) -> Option<&Row> {
        self.old.get(i)
    }
}
