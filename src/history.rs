//! Test execution state and bounded history, persisted per identifier.
//!
//! Every resource slug (REST-style testing) or standalone template path
//! (SQL-style testing) owns one [`TestState`]: the parameters, headers,
//! body, and auth the user is currently testing with, plus the last
//! [`HISTORY_LIMIT`] executions, most recent first.
//!
//! State is stored through a [`KvStore`] under a key derived from the
//! identifier with every non-alphanumeric byte replaced by `_XX` (its
//! uppercase hex), so keys never contain the storage's reserved characters
//! and distinct identifiers never share a key.
//!
//! Workspace default headers are stored once under their own key and are
//! copied into a state only when that state is first created.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::{HeaderSet, ParameterSet};
use crate::store::KvStore;

/// Maximum number of history entries kept per state.
pub const HISTORY_LIMIT: usize = 10;

const STATE_PREFIX: &str = "testState.";
const DEFAULT_HEADERS_KEY: &str = "workspaceDefaultHeaders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Rest,
    Sql,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        header: String,
        value: String,
    },
}

/// How a test reaches its target: a live REST endpoint or a template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Path the endpoint is served at, as configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    pub elapsed_ms: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub headers: HeaderSet,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseRecord {
    /// A record for a request that never produced a response.
    pub fn failed(elapsed_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: 0,
            elapsed_ms,
            size_bytes: 0,
            headers: HeaderSet::new(),
            body: String::new(),
            content_type: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parameters: ParameterSet,
    #[serde(default)]
    pub headers: HeaderSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub response: ResponseRecord,
}

impl HistoryEntry {
    /// Snapshot the inputs of `state` alongside `response`.
    pub fn from_state(state: &TestState, response: ResponseRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            parameters: state.parameters.clone(),
            headers: state.headers.clone(),
            body: state.body.clone(),
            response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestState {
    pub id: String,
    pub kind: TestKind,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub parameters: ParameterSet,
    #[serde(default)]
    pub headers: HeaderSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl TestState {
    fn new(id: &str, kind: TestKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            connection: ConnectionInfo::default(),
            config_path: None,
            last_used: Utc::now(),
            parameters: ParameterSet::new(),
            headers: HeaderSet::new(),
            body: None,
            auth: AuthConfig::None,
            history: Vec::new(),
        }
    }

    /// Prepend `entry` and drop everything past [`HISTORY_LIMIT`].
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.insert(0, entry);
        self.history.truncate(HISTORY_LIMIT);
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.history.first()
    }
}

/// Inputs for [`TestStateStore::initialize_rest_state`].
#[derive(Debug, Clone, Default)]
pub struct RestTarget {
    pub method: Option<String>,
    pub base_url: Option<String>,
    pub url_path: Option<String>,
    pub config_path: Option<PathBuf>,
}

/// Storage key for an identifier.
pub fn storage_key(id: &str) -> String {
    let mut key = String::with_capacity(STATE_PREFIX.len() + id.len());
    key.push_str(STATE_PREFIX);
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() {
            key.push(byte as char);
        } else {
            key.push_str(&format!("_{byte:02X}"));
        }
    }
    key
}

/// Durable per-identifier test state.
#[derive(Clone)]
pub struct TestStateStore {
    kv: Arc<dyn KvStore>,
}

impl TestStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn get_state(&self, id: &str) -> Result<Option<TestState>> {
        match self.kv.get(&storage_key(id)).await? {
            Some(value) => {
                let state: TestState = serde_json::from_value(value)
                    .with_context(|| format!("Corrupt test state for '{}'", id))?;
                if state.id != id {
                    tracing::warn!(id, stored = %state.id, "ignoring test state stored for another identifier");
                    return Ok(None);
                }
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub async fn save_state(&self, state: &TestState) -> Result<()> {
        self.kv
            .set(&storage_key(&state.id), serde_json::to_value(state)?)
            .await
    }

    async fn require_state(&self, id: &str) -> Result<TestState> {
        self.get_state(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no test state for '{}'", id))
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<TestState>
    where
        F: FnOnce(&mut TestState),
    {
        let mut state = self.require_state(id).await?;
        f(&mut state);
        self.save_state(&state).await?;
        Ok(state)
    }

    pub async fn update_parameters(&self, id: &str, parameters: ParameterSet) -> Result<TestState> {
        self.mutate(id, |s| s.parameters = parameters).await
    }

    pub async fn update_headers(&self, id: &str, headers: HeaderSet) -> Result<TestState> {
        self.mutate(id, |s| s.headers = headers).await
    }

    pub async fn update_body(&self, id: &str, body: Option<String>) -> Result<TestState> {
        self.mutate(id, |s| s.body = body).await
    }

    pub async fn update_auth_config(&self, id: &str, auth: AuthConfig) -> Result<TestState> {
        self.mutate(id, |s| s.auth = auth).await
    }

    /// Record an execution. Also stamps `last_used`.
    pub async fn add_to_history(&self, id: &str, entry: HistoryEntry) -> Result<TestState> {
        self.mutate(id, |s| {
            s.last_used = entry.timestamp;
            s.push_history(entry);
        })
        .await
    }

    pub async fn clear_history(&self, id: &str) -> Result<TestState> {
        self.mutate(id, |s| s.history.clear()).await
    }

    /// Create the REST state for `id`, or refresh the target fields of an
    /// existing one. Parameters, headers, body, auth, and history of an
    /// existing state are left alone.
    pub async fn initialize_rest_state(&self, id: &str, target: RestTarget) -> Result<TestState> {
        let state = match self.get_state(id).await? {
            Some(mut state) => {
                if target.method.is_some() {
                    state.connection.method = target.method;
                }
                if target.base_url.is_some() {
                    state.connection.base_url = target.base_url;
                }
                if target.url_path.is_some() {
                    state.connection.url_path = target.url_path;
                }
                if target.config_path.is_some() {
                    state.config_path = target.config_path;
                }
                state.last_used = Utc::now();
                state
            }
            None => {
                let mut state = TestState::new(id, TestKind::Rest);
                state.connection.method = target.method;
                state.connection.base_url = target.base_url;
                state.connection.url_path = target.url_path;
                state.config_path = target.config_path;
                state.headers = self.get_default_headers().await?;
                state
            }
        };
        self.save_state(&state).await?;
        Ok(state)
    }

    /// Create the SQL state for `id` (usually the template path), or
    /// refresh the template and config paths of an existing one.
    pub async fn initialize_sql_state(
        &self,
        id: &str,
        template_path: PathBuf,
        config_path: Option<PathBuf>,
    ) -> Result<TestState> {
        let state = match self.get_state(id).await? {
            Some(mut state) => {
                state.connection.template_path = Some(template_path);
                if config_path.is_some() {
                    state.config_path = config_path;
                }
                state.last_used = Utc::now();
                state
            }
            None => {
                let mut state = TestState::new(id, TestKind::Sql);
                state.connection.template_path = Some(template_path);
                state.config_path = config_path;
                state
            }
        };
        self.save_state(&state).await?;
        Ok(state)
    }

    pub async fn get_default_headers(&self) -> Result<HeaderSet> {
        match self.kv.get(DEFAULT_HEADERS_KEY).await? {
            Some(value) => {
                serde_json::from_value(value).context("Corrupt workspace default headers")
            }
            None => Ok(HeaderSet::new()),
        }
    }

    pub async fn set_default_headers(&self, headers: &HeaderSet) -> Result<()> {
        self.kv
            .set(DEFAULT_HEADERS_KEY, serde_json::to_value(headers)?)
            .await
    }

    /// All stored states, skipping entries that fail to decode.
    pub async fn list_states(&self) -> Result<Vec<TestState>> {
        let mut states = Vec::new();
        for key in self.kv.keys(STATE_PREFIX).await? {
            if let Some(value) = self.kv.get(&key).await? {
                match serde_json::from_value::<TestState>(value) {
                    Ok(state) => states.push(state),
                    Err(e) => tracing::warn!(key = %key, error = %e, "skipping corrupt test state"),
                }
            }
        }
        states.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(states)
    }

    pub async fn delete_state(&self, id: &str) -> Result<bool> {
        self.kv.delete(&storage_key(id)).await
    }

    /// Remove every state and the workspace default headers.
    pub async fn reset_all(&self) -> Result<usize> {
        let keys = self.kv.keys(STATE_PREFIX).await?;
        let count = keys.len();
        for key in keys {
            self.kv.delete(&key).await?;
        }
        self.kv.delete(DEFAULT_HEADERS_KEY).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn store() -> TestStateStore {
        TestStateStore::new(Arc::new(MemoryKvStore::new()))
    }

    fn response(status: u16) -> ResponseRecord {
        ResponseRecord {
            status,
            elapsed_ms: 5,
            size_bytes: 2,
            headers: HeaderSet::new(),
            body: "[]".to_string(),
            content_type: Some("application/json".to_string()),
            error: None,
        }
    }

    fn rest(method: &str) -> RestTarget {
        RestTarget {
            method: Some(method.to_string()),
            base_url: Some("http://localhost:8080".to_string()),
            url_path: None,
            config_path: None,
        }
    }

    #[test]
    fn storage_key_escapes_non_alphanumerics() {
        assert_eq!(storage_key("customers-slash"), "testState.customers_2Dslash");
        assert_eq!(storage_key("/tmp/q.sql"), "testState._2Ftmp_2Fq_2Esql");
        assert_ne!(storage_key("a-b"), storage_key("a_b"));
        assert_ne!(storage_key("a_2Db"), storage_key("a-b"));
    }

    #[tokio::test]
    async fn similar_identifiers_keep_separate_states() {
        let store = store();
        store.initialize_rest_state("a-b", rest("GET")).await.unwrap();
        let mut secret = ParameterSet::new();
        secret.insert("secret".to_string(), "from /a/b".to_string());
        store.update_parameters("a-b", secret.clone()).await.unwrap();

        assert!(store.get_state("a_b").await.unwrap().is_none());
        store.initialize_rest_state("a_b", rest("POST")).await.unwrap();
        store.update_parameters("a_b", ParameterSet::new()).await.unwrap();

        let first = store.get_state("a-b").await.unwrap().unwrap();
        assert_eq!(first.parameters, secret);
        assert_eq!(first.connection.method.as_deref(), Some("GET"));
        let second = store.get_state("a_b").await.unwrap().unwrap();
        assert_eq!(second.id, "a_b");
        assert!(second.parameters.is_empty());
    }

    #[tokio::test]
    async fn state_under_a_foreign_key_reads_as_absent() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = TestStateStore::new(kv.clone());
        let state = store.initialize_rest_state("orders", rest("GET")).await.unwrap();
        kv.set(&storage_key("other"), serde_json::to_value(&state).unwrap())
            .await
            .unwrap();

        assert!(store.get_state("other").await.unwrap().is_none());
        assert!(store.get_state("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn history_is_capped_and_evicts_oldest() {
        let store = store();
        store.initialize_rest_state("orders", rest("GET")).await.unwrap();

        for status in 1..=HISTORY_LIMIT as u16 {
            let state = store.get_state("orders").await.unwrap().unwrap();
            store
                .add_to_history("orders", HistoryEntry::from_state(&state, response(status)))
                .await
                .unwrap();
        }
        let state = store.get_state("orders").await.unwrap().unwrap();
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history.last().unwrap().response.status, 1);

        let state = store
            .add_to_history("orders", HistoryEntry::from_state(&state, response(11)))
            .await
            .unwrap();
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history[0].response.status, 11);
        assert_eq!(state.history.last().unwrap().response.status, 2);
        assert!(state.history.iter().all(|e| e.response.status != 1));
    }

    #[tokio::test]
    async fn reinitializing_rest_state_preserves_parameters() {
        let store = store();
        store.initialize_rest_state("orders", rest("GET")).await.unwrap();
        let params: ParameterSet = [("id".to_string(), "42".to_string())].into();
        store.update_parameters("orders", params.clone()).await.unwrap();

        let state = store.initialize_rest_state("orders", rest("POST")).await.unwrap();
        assert_eq!(state.parameters, params);
        assert_eq!(state.connection.method.as_deref(), Some("POST"));
        assert_eq!(state.kind, TestKind::Rest);
    }

    #[tokio::test]
    async fn default_headers_apply_only_at_creation() {
        let store = store();
        let defaults: HeaderSet = [("X-Team".to_string(), "data".to_string())].into();
        store.set_default_headers(&defaults).await.unwrap();

        let first = store.initialize_rest_state("a", rest("GET")).await.unwrap();
        assert_eq!(first.headers, defaults);

        store.set_default_headers(&HeaderSet::new()).await.unwrap();
        let again = store.initialize_rest_state("a", rest("GET")).await.unwrap();
        assert_eq!(again.headers, defaults);

        let fresh = store.initialize_rest_state("b", rest("GET")).await.unwrap();
        assert!(fresh.headers.is_empty());
    }

    #[tokio::test]
    async fn sql_state_keyed_by_template_path() {
        let store = store();
        let path = PathBuf::from("/work/sqls/customers.sql");
        let state = store
            .initialize_sql_state("/work/sqls/customers.sql", path.clone(), None)
            .await
            .unwrap();
        assert_eq!(state.kind, TestKind::Sql);
        assert_eq!(state.connection.template_path, Some(path));
    }

    #[tokio::test]
    async fn updates_require_existing_state() {
        let store = store();
        assert!(store.update_body("missing", Some("{}".into())).await.is_err());
    }

    #[tokio::test]
    async fn auth_body_and_clear_history() {
        let store = store();
        store.initialize_rest_state("x", rest("POST")).await.unwrap();
        store
            .update_auth_config(
                "x",
                AuthConfig::Bearer {
                    token: "t".to_string(),
                },
            )
            .await
            .unwrap();
        store.update_body("x", Some("{\"a\":1}".to_string())).await.unwrap();
        let state = store.get_state("x").await.unwrap().unwrap();
        store
            .add_to_history("x", HistoryEntry::from_state(&state, response(200)))
            .await
            .unwrap();

        let state = store.clear_history("x").await.unwrap();
        assert!(state.history.is_empty());
        assert_eq!(state.body.as_deref(), Some("{\"a\":1}"));
        assert_eq!(state.auth, AuthConfig::Bearer { token: "t".to_string() });
    }

    #[tokio::test]
    async fn reset_all_removes_states_and_defaults() {
        let store = store();
        store.initialize_rest_state("a", rest("GET")).await.unwrap();
        store.initialize_rest_state("b", rest("GET")).await.unwrap();
        store
            .set_default_headers(&[("k".to_string(), "v".to_string())].into())
            .await
            .unwrap();

        assert_eq!(store.list_states().await.unwrap().len(), 2);
        assert_eq!(store.reset_all().await.unwrap(), 2);
        assert!(store.list_states().await.unwrap().is_empty());
        assert!(store.get_default_headers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_state_removes_only_that_identifier() {
        let store = store();
        store.initialize_rest_state("a-b", rest("GET")).await.unwrap();
        store.initialize_rest_state("a_b", rest("GET")).await.unwrap();

        assert!(store.delete_state("a-b").await.unwrap());
        assert!(!store.delete_state("a-b").await.unwrap());
        assert!(store.get_state("a-b").await.unwrap().is_none());
        assert!(store.get_state("a_b").await.unwrap().is_some());
    }

    #[test]
    fn auth_config_wire_shape() {
        let json = serde_json::to_value(AuthConfig::ApiKey {
            header: "X-Key".into(),
            value: "v".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "apiKey", "header": "X-Key", "value": "v" })
        );
    }
}
