//! Client for the backend configuration service.
//!
//! Defines the [`ConfigBackend`] trait (one method per REST operation the
//! engine consumes) and [`HttpBackend`], its `reqwest` implementation.
//!
//! # Endpoints
//!
//! All paths are relative to `<base_url>/api/v1/_config`.
//!
//! | Method | Path | Trait method |
//! |--------|------|--------------|
//! | `GET`  | `/endpoints` | [`list_endpoints`](ConfigBackend::list_endpoints) |
//! | `GET`/`PUT` | `/endpoints/{slug}` | [`get_endpoint`](ConfigBackend::get_endpoint) / [`put_endpoint`](ConfigBackend::put_endpoint) |
//! | `GET`/`PUT` | `/endpoints/{slug}/template` | [`get_template`](ConfigBackend::get_template) / [`put_template`](ConfigBackend::put_template) |
//! | `GET`/`PUT` | `/endpoints/{slug}/cache` | [`get_cache`](ConfigBackend::get_cache) / [`put_cache`](ConfigBackend::put_cache) |
//! | `GET`/`PUT` | `/endpoints/{slug}/cache/template` | [`get_cache_template`](ConfigBackend::get_cache_template) / [`put_cache_template`](ConfigBackend::put_cache_template) |
//! | `POST` | `/endpoints/{slug}/cache/refresh` | [`refresh_cache`](ConfigBackend::refresh_cache) |
//! | `POST` | `/endpoints/{slug}/template/expand` | [`expand_template`](ConfigBackend::expand_template) |
//! | `POST` | `/endpoints/{slug}/template/test` | [`test_template`](ConfigBackend::test_template) |
//! | `GET`  | `/endpoints/{slug}/parameters` | [`get_parameters`](ConfigBackend::get_parameters) |
//! | `POST` | `/endpoints/by-template` | [`find_by_template`](ConfigBackend::find_by_template) |
//!
//! Trait methods take the workbench slug of a resource; `HttpBackend`
//! turns it into the service's route slug
//! ([`identity::route_slug`](crate::identity::route_slug)) when building
//! URLs.
//!
//! # Retry Strategy
//!
//! Only `GET`s are retried: network errors, HTTP 429, and 5xx back off
//! exponentially (250ms, 500ms, 1s, ...) up to `backend.max_retries`
//! times. Writes are sent exactly once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::WorkbenchError;
use crate::identity;
use crate::models::{parameter_set_to_json, ParameterSet};

/// Path prefix of the configuration API.
pub const CONFIG_API_BASE: &str = "/api/v1/_config";

/// Flags for [`ConfigBackend::expand_template`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandOptions {
    pub validate_only: bool,
    pub include_variables: bool,
}

/// Position of a validation issue, 1-based as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePosition {
    pub line: u32,
    #[serde(default, alias = "character")]
    pub column: Option<u32>,
}

/// One error or warning from a validate-only expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawIssue")]
pub struct ValidationIssue {
    pub message: String,
    pub position: Option<IssuePosition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIssue {
    Text(String),
    Detailed {
        message: String,
        #[serde(default)]
        position: Option<IssuePosition>,
        #[serde(default)]
        line: Option<u32>,
        #[serde(default, alias = "character")]
        column: Option<u32>,
    },
}

impl From<RawIssue> for ValidationIssue {
    fn from(raw: RawIssue) -> Self {
        match raw {
            RawIssue::Text(message) => Self {
                message,
                position: None,
            },
            RawIssue::Detailed {
                message,
                position,
                line,
                column,
            } => Self {
                message,
                position: position.or(line.map(|line| IssuePosition { line, column })),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpandResponse {
    #[serde(default, alias = "expanded_sql", alias = "expandedSql", alias = "sql")]
    pub expanded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, alias = "expanded_sql", alias = "expandedSql")]
    pub expanded: Option<String>,
    #[serde(default)]
    pub columns: Vec<Value>,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default, alias = "rowCount")]
    pub row_count: Option<u64>,
    #[serde(default, alias = "executionTimeMs", alias = "execution_time")]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TestResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.success != Some(false)
    }
}

/// Parameter metadata used to seed default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterMeta {
    #[serde(alias = "field-name", alias = "field_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParameterList {
    List(Vec<ParameterMeta>),
    Wrapper { parameters: Vec<ParameterMeta> },
}

/// A resource as listed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(
        default,
        alias = "url-path",
        alias = "url_path",
        alias = "path",
        skip_serializing_if = "Option::is_none"
    )]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        alias = "config_file_path",
        alias = "config-file",
        skip_serializing_if = "Option::is_none"
    )]
    pub config_file: Option<String>,
}

impl EndpointRef {
    /// The workbench slug of this resource. Derived from the URL path when
    /// known, since the service's own slug does not round-trip hyphens.
    pub fn resolved_slug(&self) -> Option<String> {
        if let Some(slug) = self.url_path.as_deref().and_then(|p| identity::to_slug(p).ok()) {
            return Some(slug);
        }
        self.slug.clone()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointList {
    List(Vec<EndpointRef>),
    Wrapper { endpoints: Vec<EndpointRef> },
    Map(serde_json::Map<String, Value>),
}

impl EndpointList {
    fn into_refs(self) -> Vec<EndpointRef> {
        match self {
            EndpointList::List(list) => list,
            EndpointList::Wrapper { endpoints } => endpoints,
            // `{ "/customers": {...}, ... }` keyed by path
            EndpointList::Map(map) => map
                .into_iter()
                .map(|(path, value)| {
                    let mut entry: EndpointRef =
                        serde_json::from_value(value).unwrap_or_default();
                    if entry.url_path.is_none() {
                        entry.url_path = Some(path);
                    }
                    entry
                })
                .collect(),
        }
    }
}

/// The configuration service the engine synchronises against.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Base URL at which the configured endpoints themselves are served,
    /// used for live REST test executions.
    fn server_url(&self) -> Option<String> {
        None
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRef>>;

    async fn get_endpoint(&self, slug: &str) -> Result<Value>;

    async fn put_endpoint(&self, slug: &str, config: &Value) -> Result<()>;

    async fn get_template(&self, slug: &str) -> Result<String>;

    async fn put_template(&self, slug: &str, template: &str) -> Result<()>;

    async fn get_cache(&self, slug: &str) -> Result<Value>;

    async fn put_cache(&self, slug: &str, cache: &Value) -> Result<()>;

    async fn get_cache_template(&self, slug: &str) -> Result<String>;

    async fn put_cache_template(&self, slug: &str, template: &str) -> Result<()>;

    async fn refresh_cache(&self, slug: &str) -> Result<Value>;

    async fn expand_template(
        &self,
        slug: &str,
        parameters: &ParameterSet,
        options: ExpandOptions,
    ) -> Result<ExpandResponse>;

    async fn test_template(
        &self,
        slug: &str,
        parameters: &ParameterSet,
        limit: u32,
    ) -> Result<TestResponse>;

    async fn get_parameters(&self, slug: &str) -> Result<Vec<ParameterMeta>>;

    async fn find_by_template(&self, template_path: &Path) -> Result<Vec<EndpointRef>>;
}

/// [`ConfigBackend`] over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    max_retries: u32,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            max_retries: config.max_retries,
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}{}{}", self.base_url, CONFIG_API_BASE, tail)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// `GET` with retry/backoff, returning the raw body text.
    async fn get_text(&self, tail: &str) -> Result<String> {
        let url = self.url(tail);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 << (attempt - 1).min(4));
                tokio::time::sleep(delay).await;
            }

            let resp = self.authorize(self.client.get(&url)).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }
                    let err = backend_error(response).await;
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(url = %url, attempt, "retrying backend GET: {}", err);
                        last_err = Some(err.into());
                        continue;
                    }
                    return Err(err.into());
                }
                Err(e) => {
                    tracing::debug!(url = %url, attempt, "backend GET failed: {}", e);
                    last_err = Some(anyhow::Error::new(e).context(format!("GET {} failed", url)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("GET {} failed after retries", url)))
    }

    async fn get_json(&self, tail: &str) -> Result<Value> {
        let text = self.get_text(tail).await?;
        parse_body(&text)
    }

    /// Send a JSON body once and return the parsed response (`null` for an
    /// empty body).
    async fn send_json(&self, method: Method, tail: &str, body: &Value) -> Result<Value> {
        let url = self.url(tail);
        let response = self
            .authorize(self.client.request(method.clone(), &url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;

        if !response.status().is_success() {
            return Err(backend_error(response).await.into());
        }
        let text = response.text().await?;
        parse_body(&text)
    }
}

/// Route for a resource, addressed by the service's own slug.
fn endpoint_tail(slug: &str, rest: &str) -> Result<String> {
    Ok(format!("/endpoints/{}{}", identity::route_slug(slug)?, rest))
}

fn parse_body(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).context("Backend returned invalid JSON")
}

/// Template bodies come back as `{ "template": "..." }`, a JSON string, or
/// plain text.
fn template_from_body(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => match obj.get("template") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
        Ok(Value::String(s)) => s,
        _ => text.to_string(),
    }
}

async fn backend_error(response: Response) -> WorkbenchError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| text.trim().to_string());
    WorkbenchError::Backend { status, message }
}

#[async_trait]
impl ConfigBackend for HttpBackend {
    fn server_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    async fn list_endpoints(&self) -> Result<Vec<EndpointRef>> {
        let value = self.get_json("/endpoints").await?;
        let list: EndpointList =
            serde_json::from_value(value).context("Unexpected endpoint list shape")?;
        Ok(list.into_refs())
    }

    async fn get_endpoint(&self, slug: &str) -> Result<Value> {
        self.get_json(&endpoint_tail(slug, "")?).await
    }

    async fn put_endpoint(&self, slug: &str, config: &Value) -> Result<()> {
        self.send_json(Method::PUT, &endpoint_tail(slug, "")?, config)
            .await?;
        Ok(())
    }

    async fn get_template(&self, slug: &str) -> Result<String> {
        let text = self.get_text(&endpoint_tail(slug, "/template")?).await?;
        Ok(template_from_body(&text))
    }

    async fn put_template(&self, slug: &str, template: &str) -> Result<()> {
        self.send_json(
            Method::PUT,
            &endpoint_tail(slug, "/template")?,
            &json!({ "template": template }),
        )
        .await?;
        Ok(())
    }

    async fn get_cache(&self, slug: &str) -> Result<Value> {
        self.get_json(&endpoint_tail(slug, "/cache")?).await
    }

    async fn put_cache(&self, slug: &str, cache: &Value) -> Result<()> {
        self.send_json(Method::PUT, &endpoint_tail(slug, "/cache")?, cache)
            .await?;
        Ok(())
    }

    async fn get_cache_template(&self, slug: &str) -> Result<String> {
        let text = self
            .get_text(&endpoint_tail(slug, "/cache/template")?)
            .await?;
        Ok(template_from_body(&text))
    }

    async fn put_cache_template(&self, slug: &str, template: &str) -> Result<()> {
        self.send_json(
            Method::PUT,
            &endpoint_tail(slug, "/cache/template")?,
            &json!({ "template": template }),
        )
        .await?;
        Ok(())
    }

    async fn refresh_cache(&self, slug: &str) -> Result<Value> {
        self.send_json(
            Method::POST,
            &endpoint_tail(slug, "/cache/refresh")?,
            &json!({}),
        )
        .await
    }

    async fn expand_template(
        &self,
        slug: &str,
        parameters: &ParameterSet,
        options: ExpandOptions,
    ) -> Result<ExpandResponse> {
        let mut query = Vec::new();
        if options.validate_only {
            query.push("validate_only=true");
        }
        if options.include_variables {
            query.push("include_variables=true");
        }
        let mut tail = endpoint_tail(slug, "/template/expand")?;
        if !query.is_empty() {
            tail.push('?');
            tail.push_str(&query.join("&"));
        }

        let value = self
            .send_json(
                Method::POST,
                &tail,
                &json!({ "parameters": parameter_set_to_json(parameters) }),
            )
            .await?;
        serde_json::from_value(value).context("Unexpected expand response shape")
    }

    async fn test_template(
        &self,
        slug: &str,
        parameters: &ParameterSet,
        limit: u32,
    ) -> Result<TestResponse> {
        let value = self
            .send_json(
                Method::POST,
                &endpoint_tail(slug, "/template/test")?,
                &json!({ "parameters": parameter_set_to_json(parameters), "limit": limit }),
            )
            .await?;
        serde_json::from_value(value).context("Unexpected test response shape")
    }

    async fn get_parameters(&self, slug: &str) -> Result<Vec<ParameterMeta>> {
        let value = self.get_json(&endpoint_tail(slug, "/parameters")?).await?;
        let list: ParameterList =
            serde_json::from_value(value).context("Unexpected parameter metadata shape")?;
        Ok(match list {
            ParameterList::List(list) => list,
            ParameterList::Wrapper { parameters } => parameters,
        })
    }

    async fn find_by_template(&self, template_path: &Path) -> Result<Vec<EndpointRef>> {
        let value = self
            .send_json(
                Method::POST,
                "/endpoints/by-template",
                &json!({ "template_path": template_path.display().to_string() }),
            )
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let list: EndpointList =
            serde_json::from_value(value).context("Unexpected by-template response shape")?;
        Ok(list.into_refs())
    }
}
