//! Process configuration
//!
//! Loaded from a YAML file selected with `-f`; the binary seeds the
//! coordinator namespace from it at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PorterError, Result};
use crate::readers::ReaderConfig;
use crate::rules::SyncRule;
use crate::sinks::SinkEndpoint;
use crate::sync::dispatcher::DEFAULT_POOL_SIZE;

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9100".to_string()
}

/// Top-level porter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PorterConfig {
    /// Dispatcher worker-pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Metrics endpoint bind address
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
    /// Reader catalog seeded into the coordinator
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,
    /// Sync rules grouped by `<database>_<table>`
    #[serde(default)]
    pub rules: HashMap<String, Vec<SyncRule>>,
    /// Sink endpoints: kind, then instance name
    #[serde(default)]
    pub writers: HashMap<String, HashMap<String, SinkEndpoint>>,
}

impl PorterConfig {
    /// Loads and validates the config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PorterError::Config {
            message: format!("read {}: {e}", path.display()),
        })?;

        serde_yaml::from_str(&content).map_err(|e| PorterError::Config {
            message: format!("parse {}: {e}", path.display()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
pool_size: 8
readers:
  - type: http
    config:
      listen: "0.0.0.0:8044"
      push_path: "/events"
rules:
  shop_users:
    - database: shop
      table: users
      primary_key: id
      lock_columns: [id]
      columns: {id: id, name: name}
      target: "search:main.users"
      sync_type: copy
writers:
  search:
    main:
      host: localhost
      port: 9200
"#;
        let config: PorterConfig = serde_yaml::from_str(raw).unwrap();

        assert_eq!(config.pool_size, 8);
        assert_eq!(config.readers.len(), 1);
        assert_eq!(config.rules["shop_users"][0].sink_kind, "search");
        assert_eq!(config.writers["search"]["main"].port, 9200);
        assert_eq!(config.metrics_listen, "0.0.0.0:9100");
    }

    #[test]
    fn test_defaults_apply() {
        let config: PorterConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert!(config.readers.is_empty());
    }

    #[test]
    fn test_bad_rule_target_fails_load() {
        let raw = r#"
rules:
  shop_users:
    - database: shop
      table: users
      primary_key: id
      columns: {id: id}
      target: "users"
      sync_type: copy
"#;
        assert!(serde_yaml::from_str::<PorterConfig>(raw).is_err());
    }
}
