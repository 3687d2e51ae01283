//! Search-index sink
//!
//! Applies changes to an Elasticsearch-compatible index over its REST
//! API. COPY rows become whole documents (upserted, so replayed inserts
//! are idempotent); JOIN rows become a nested object under the join
//! field; INNER values are kept in an array field with idempotent
//! scripted add/remove.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ClientPool, Sink, SinkEndpoint};
use crate::error::{PorterError, Result};
use crate::rules::SyncMode;
use crate::sync::task::{SinkValues, SyncTask};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const INNER_ADD_SCRIPT: &str = "if(ctx._source.:key == null) { ctx._source.:key = [params.value] } else if(!ctx._source.:key.contains(params.value)) { ctx._source.:key.add(params.value) }";
const INNER_REMOVE_SCRIPT: &str = "if(ctx._source.:key != null && ctx._source.:key.contains(params.value)) { ctx._source.:key.remove(ctx._source.:key.indexOf(params.value)) }";
const REMOVE_FIELD_SCRIPT: &str = "if(ctx._source.:key != null) {ctx._source.remove(':key')}";

struct SearchClient {
    http: reqwest::Client,
    base: String,
    username: Option<String>,
    password: Option<String>,
}

impl SearchClient {
    fn connect(endpoint: SinkEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PorterError::Sink {
                message: format!("search client build failed: {e}"),
            })?;

        Ok(Self {
            http,
            base: format!("http://{}:{}", endpoint.host, endpoint.port),
            username: endpoint.username,
            password: endpoint.password,
        })
    }

    async fn request(&self, method: reqwest::Method, url: String, body: Option<Value>) -> Result<()> {
        let mut request = self.http.request(method, url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| PorterError::Sink {
            message: format!("search request failed: {e}"),
        })?;

        if let Err(e) = response.error_for_status() {
            return Err(PorterError::Sink {
                message: format!("search index rejected write: {e}"),
            });
        }
        Ok(())
    }

    async fn update_doc(&self, index: &str, id: &str, body: Value) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            format!("{}/{}/_update/{}", self.base, index, id),
            Some(body),
        )
        .await
    }

    async fn delete_doc(&self, index: &str, id: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            format!("{}/{}/_doc/{}", self.base, index, id),
            None,
        )
        .await
    }
}

/// Sink for the search-index family
pub struct SearchSink {
    clients: ClientPool<SearchClient>,
}

impl SearchSink {
    pub fn new() -> Self {
        Self {
            clients: ClientPool::new(),
        }
    }

    async fn client(&self, instance: &str) -> Result<Arc<SearchClient>> {
        self.clients
            .get_or_connect(instance, |endpoint| async move {
                SearchClient::connect(endpoint)
            })
            .await
    }

    fn script_for(template: &str, join_field: &str) -> String {
        template.replace(":key", join_field)
    }

    fn join_field(task: &SyncTask) -> &str {
        task.rule.join_field.as_deref().unwrap_or_default()
    }
}

impl Default for SearchSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Document body for one upsert, shaped by the sync mode
pub(crate) fn upsert_body(task: &SyncTask, values: &SinkValues) -> Value {
    match values {
        SinkValues::Element(value) => {
            let join_field = task.rule.join_field.as_deref().unwrap_or_default();
            let pk_target = task
                .rule
                .columns
                .get(&task.rule.primary_key)
                .cloned()
                .unwrap_or_else(|| task.rule.primary_key.clone());

            // First write creates the array outright; later writes go
            // through the scripted add
            let mut upsert = serde_json::Map::new();
            upsert.insert(join_field.to_string(), json!([value]));
            upsert.insert(pk_target, json!(task.primary_key_value()));

            json!({
                "script": {
                    "source": SearchSink::script_for(INNER_ADD_SCRIPT, join_field),
                    "params": {"value": value},
                },
                "upsert": Value::Object(upsert),
            })
        }
        SinkValues::Record(record) => {
            json!({"doc": record, "doc_as_upsert": true})
        }
        SinkValues::Document(doc) => {
            json!({"doc": doc, "doc_as_upsert": true})
        }
    }
}

#[async_trait]
impl Sink for SearchSink {
    async fn insert(&self, task: &SyncTask, values: SinkValues) -> Result<()> {
        let client = self.client(&task.rule.sink_instance).await?;
        let body = upsert_body(task, &values);

        client
            .update_doc(&task.rule.target_table, task.primary_key_value(), body)
            .await
    }

    async fn update(&self, task: &SyncTask, values: SinkValues) -> Result<()> {
        // Updates upsert the same way inserts do; JOIN and INNER carry
        // no distinct update shape
        self.insert(task, values).await
    }

    async fn delete(&self, task: &SyncTask) -> Result<()> {
        let client = self.client(&task.rule.sink_instance).await?;
        let index = &task.rule.target_table;
        let id = task.primary_key_value();

        match task.rule.sync_mode {
            SyncMode::Copy => client.delete_doc(index, id).await,
            SyncMode::Inner => {
                let join_field = Self::join_field(task);
                let value = task
                    .rule
                    .join_column()
                    .and_then(|column| task.data.get(column))
                    .cloned()
                    .unwrap_or_default();
                let body = json!({
                    "script": {
                        "source": Self::script_for(INNER_REMOVE_SCRIPT, join_field),
                        "params": {"value": value},
                    },
                });
                client.update_doc(index, id, body).await
            }
            SyncMode::Join => {
                let join_field = Self::join_field(task);
                let body = json!({
                    "script": {
                        "source": Self::script_for(REMOVE_FIELD_SCRIPT, join_field),
                    },
                });
                client.update_doc(index, id, body).await
            }
        }
    }

    async fn set_endpoints(&self, endpoints: HashMap<String, SinkEndpoint>) -> Result<()> {
        // Evicted clients only hold an HTTP pool; dropping them closes it
        self.clients.set_endpoints(endpoints).await;
        Ok(())
    }

    async fn close(&self) {
        self.clients.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, EventKind, Row};

    fn inner_task() -> SyncTask {
        let rule = serde_json::from_str(
            r#"{"database":"t","table":"u","primary_key":"id",
                "columns":{"id":"id","tag":"tags"},
                "target":"search:main.people","sync_type":"inner",
                "join_field_name":"tags"}"#,
        )
        .unwrap();
        let event: ChangeEvent = serde_json::from_str(
            r#"{"event_id":"e","database":"t","table":"u","ts":1,
                "type":"insert","data":[{"id":"1","tag":"blue"}]}"#,
        )
        .unwrap();
        let mut data = Row::new();
        data.insert("id".into(), "1".into());
        data.insert("tag".into(), "blue".into());

        SyncTask {
            rule: Arc::new(rule),
            data,
            old: None,
            real_kind: EventKind::Insert,
            event: Arc::new(event),
        }
    }

    #[test]
    fn test_inner_insert_builds_set_add_script() {
        let task = inner_task();
        let body = upsert_body(&task, &SinkValues::Element("blue".into()));

        let script = body["script"]["source"].as_str().unwrap();
        assert!(script.contains("ctx._source.tags == null"));
        assert!(script.contains("!ctx._source.tags.contains(params.value)"));
        assert_eq!(body["script"]["params"]["value"], "blue");
        assert_eq!(body["upsert"]["tags"], json!(["blue"]));
        assert_eq!(body["upsert"]["id"], "1");
    }

    #[test]
    fn test_copy_insert_is_doc_upsert() {
        let task = inner_task();
        let mut record = HashMap::new();
        record.insert("id".to_string(), "1".to_string());
        let body = upsert_body(&task, &SinkValues::Record(record));

        assert_eq!(body["doc_as_upsert"], true);
        assert_eq!(body["doc"]["id"], "1");
    }
}
