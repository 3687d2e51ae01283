//! Tabular sink
//!
//! Writes COPY-mode rows to a MySQL-compatible store. JOIN and INNER
//! have no tabular representation and are rejected deterministically
//! before any connection is touched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

use super::{ClientPool, Sink, SinkEndpoint, SINK_KIND_TABLE};
use crate::error::{PorterError, Result};
use crate::rules::{SyncMode, SyncRule};
use crate::sync::task::{SinkValues, SyncTask};

/// Sink for tabular stores
pub struct TableSink {
    clients: ClientPool<MySqlPool>,
}

impl TableSink {
    pub fn new() -> Self {
        Self {
            clients: ClientPool::new(),
        }
    }

    fn ensure_copy(rule: &SyncRule) -> Result<()> {
        if rule.sync_mode != SyncMode::Copy {
            return Err(PorterError::SinkModeUnsupported {
                kind: SINK_KIND_TABLE.to_string(),
                mode: rule.sync_mode.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn record(values: SinkValues) -> Result<HashMap<String, String>> {
        match values {
            SinkValues::Record(record) => Ok(record),
            _ => Err(PorterError::SinkModeUnsupported {
                kind: SINK_KIND_TABLE.to_string(),
                mode: "non-record values".to_string(),
            }),
        }
    }

    /// `db`.`table` or bare `table` for the two-part target form
    fn table_name(rule: &SyncRule) -> String {
        match &rule.target_database {
            Some(database) => format!("`{}`.`{}`", database, rule.target_table),
            None => format!("`{}`", rule.target_table),
        }
    }

    /// Mapped name of the primary-key column in the target table
    fn primary_column(rule: &SyncRule) -> &str {
        rule.columns
            .get(&rule.primary_key)
            .map(String::as_str)
            .unwrap_or(rule.primary_key.as_str())
    }

    async fn pool(&self, instance: &str) -> Result<Arc<MySqlPool>> {
        self.clients
            .get_or_connect(instance, |endpoint| async move {
                let auth = match (&endpoint.username, &endpoint.password) {
                    (Some(username), Some(password)) => format!("{username}:{password}@"),
                    (Some(username), None) => format!("{username}@"),
                    _ => String::new(),
                };
                let database = endpoint.database.clone().unwrap_or_default();
                let url = format!("mysql://{auth}{}:{}/{database}", endpoint.host, endpoint.port);

                MySqlPoolOptions::new()
                    .connect(&url)
                    .await
                    .map_err(|e| PorterError::Sink {
                        message: format!("table connect failed: {e}"),
                    })
            })
            .await
    }
}

impl Default for TableSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for TableSink {
    async fn insert(&self, task: &SyncTask, values: SinkValues) -> Result<()> {
        Self::ensure_copy(&task.rule)?;
        let record = Self::record(values)?;
        if record.is_empty() {
            return Ok(());
        }

        // Deterministic column order keeps statements cache-friendly
        let mut columns: Vec<(&String, &String)> = record.iter().collect();
        columns.sort_by_key(|(name, _)| name.as_str());

        let names: Vec<String> = columns.iter().map(|(name, _)| format!("`{name}`")).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::table_name(&task.rule),
            names.join(", "),
            placeholders
        );

        let pool = self.pool(&task.rule.sink_instance).await?;
        let mut query = sqlx::query(&sql);
        for (_, value) in &columns {
            query = query.bind(value.as_str());
        }
        query.execute(&*pool).await.map_err(|e| PorterError::Sink {
            message: format!("table insert failed: {e}"),
        })?;

        Ok(())
    }

    async fn update(&self, task: &SyncTask, values: SinkValues) -> Result<()> {
        Self::ensure_copy(&task.rule)?;
        let record = Self::record(values)?;
        if record.is_empty() {
            // Nothing changed that this rule maps; no statement to run
            return Ok(());
        }

        let mut columns: Vec<(&String, &String)> = record.iter().collect();
        columns.sort_by_key(|(name, _)| name.as_str());

        let assignments: Vec<String> = columns
            .iter()
            .map(|(name, _)| format!("`{name}` = ?"))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE `{}` = ?",
            Self::table_name(&task.rule),
            assignments.join(", "),
            Self::primary_column(&task.rule)
        );

        let pool = self.pool(&task.rule.sink_instance).await?;
        let mut query = sqlx::query(&sql);
        for (_, value) in &columns {
            query = query.bind(value.as_str());
        }
        query = query.bind(task.primary_key_value());
        query.execute(&*pool).await.map_err(|e| PorterError::Sink {
            message: format!("table update failed: {e}"),
        })?;

        Ok(())
    }

    async fn delete(&self, task: &SyncTask) -> Result<()> {
        Self::ensure_copy(&task.rule)?;

        let sql = format!(
            "DELETE FROM {} WHERE `{}` = ?",
            Self::table_name(&task.rule),
            Self::primary_column(&task.rule)
        );

        let pool = self.pool(&task.rule.sink_instance).await?;
        sqlx::query(&sql)
            .bind(task.primary_key_value())
            .execute(&*pool)
            .await
            .map_err(|e| PorterError::Sink {
                message: format!("table delete failed: {e}"),
            })?;

        Ok(())
    }

    async fn set_endpoints(&self, endpoints: HashMap<String, SinkEndpoint>) -> Result<()> {
        for pool in self.clients.set_endpoints(endpoints).await {
            pool.close().await;
        }
        Ok(())
    }

    async fn close(&self) {
        for pool in self.clients.drain().await {
            pool.close().await;
        }
    }
}
