//! Workspace orchestration: opening a resource's facets together, saving
//! them, and running expand/test/validate against the backend.
//!
//! # Open
//!
//! ```text
//! get_endpoint ─┐                      ┌─ show(config, Left)
//!               ├─ resolve layout ─ seed parameters ─ ensure sidecar ─ init test state ─┼─ show(template, Center)
//! get_parameters┘                      └─ ... one independent show per facet
//! ```
//!
//! The configuration and the parameter metadata are fetched concurrently;
//! either may fail without failing the open. Each facet is shown
//! independently and a failure to show one is logged and reported in the
//! returned [`OpenReport`].
//!
//! # Saves
//!
//! Config saves re-fetch the remote configuration, shallow-merge the
//! caller's partial object over it, and `PUT` the merged result. Other
//! facets are written whole. After any successful save the five
//! save-dependent virtual facets of the resource are refreshed.
//!
//! Every public operation reports its failure through the host
//! [`Notifier`](crate::host::Notifier) before returning the error.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::backend::{ConfigBackend, EndpointRef, ExpandOptions, ExpandResponse, ParameterMeta, TestResponse};
use crate::config::Config;
use crate::content::{ContentProviderRegistry, ProviderContext};
use crate::diagnostics::{self, Diagnostic};
use crate::error::WorkbenchError;
use crate::executor;
use crate::facets::{Facet, PanelSlot, StorageAddress, VirtualAddress};
use crate::history::{HistoryEntry, ResponseRecord, RestTarget, TestState, TestStateStore};
use crate::host::{HostSurface, NoticeLevel};
use crate::identity;
use crate::models::{parameter_set_from_json, parameter_set_to_json, shallow_merge, ParameterSet};
use crate::parameters::{self, ParameterCache, ParameterResolver};
use crate::storage::{self, FacetLayout, FacetStorageResolver};

const CONFIG_PATH_KEYS: [&str; 4] = ["config-file", "config_file", "configFile", "config_file_path"];
const URL_PATH_KEYS: [&str; 3] = ["url-path", "url_path", "urlPath"];

/// Where one facet ended up after an open.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetPlacement {
    pub facet: Facet,
    pub address: StorageAddress,
    pub slot: PanelSlot,
    pub opened: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReport {
    pub slug: String,
    pub path: String,
    pub facets: Vec<FacetPlacement>,
    pub parameters: ParameterSet,
    pub sidecar_created: bool,
}

impl OpenReport {
    pub fn placement(&self, facet: Facet) -> Option<&FacetPlacement> {
        self.facets.iter().find(|p| p.facet == facet)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFileReport {
    pub template_path: PathBuf,
    pub endpoints: Vec<EndpointRef>,
    pub state: TestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened: Option<OpenReport>,
}

pub struct Workbench {
    backend: Arc<dyn ConfigBackend>,
    registry: Arc<ContentProviderRegistry>,
    resolver: FacetStorageResolver,
    parameters: ParameterResolver,
    history: TestStateStore,
    host: HostSurface,
    http: reqwest::Client,
    row_limit: u32,
    layouts: RwLock<HashMap<String, FacetLayout>>,
}

impl Workbench {
    pub fn new(
        config: &Config,
        backend: Arc<dyn ConfigBackend>,
        history: TestStateStore,
        host: HostSurface,
    ) -> Result<Self> {
        let cache = Arc::new(ParameterCache::new());
        let registry = ContentProviderRegistry::with_builtins(ProviderContext {
            backend: backend.clone(),
            parameters: cache.clone(),
            history: history.clone(),
        })
        .with_listener(host.listener.clone());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.backend.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            backend,
            registry: Arc::new(registry),
            resolver: FacetStorageResolver::from_config(&config.workspace),
            parameters: ParameterResolver::new(cache),
            history,
            host,
            http,
            row_limit: config.testing.row_limit,
            layouts: RwLock::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn ConfigBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<ContentProviderRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &TestStateStore {
        &self.history
    }

    /// Run `op`, reporting a failure to the user before returning it.
    async fn reported<T>(&self, action: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match op.await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(action, "operation failed: {:#}", e);
                self.host
                    .notifier
                    .notify(NoticeLevel::Error, &format!("{action} failed: {e:#}"))
                    .await;
                Err(e)
            }
        }
    }

    /// Cached layout of `slug`, resolving it from the backend on first use.
    pub async fn layout(&self, slug: &str) -> Result<FacetLayout> {
        if let Some(layout) = self.layouts.read().await.get(slug) {
            return Ok(layout.clone());
        }
        let config = match self.backend.get_endpoint(slug).await {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(slug, "no configuration for layout: {:#}", e);
                Value::Null
            }
        };
        self.store_layout(&config, slug).await
    }

    async fn store_layout(&self, config: &Value, slug: &str) -> Result<FacetLayout> {
        let layout = self.resolver.resolve(config, slug)?;
        self.layouts
            .write()
            .await
            .insert(slug.to_string(), layout.clone());
        Ok(layout)
    }

    pub async fn effective_parameters(&self, slug: &str) -> Result<ParameterSet> {
        let layout = self.layout(slug).await?;
        Ok(self.parameters.effective_parameters(slug, Some(&layout)).await)
    }

    pub async fn open(&self, path: &str) -> Result<OpenReport> {
        let slug = self
            .reported("Open endpoint", async { Ok(identity::to_slug(path)?) })
            .await?;
        self.open_slug(&slug).await
    }

    pub async fn open_slug(&self, slug: &str) -> Result<OpenReport> {
        self.reported("Open endpoint", self.open_inner(slug)).await
    }

    async fn open_inner(&self, slug: &str) -> Result<OpenReport> {
        let decoded_path = identity::to_path(slug)?;

        let (config, metadata) = tokio::join!(
            self.backend.get_endpoint(slug),
            self.backend.get_parameters(slug)
        );
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(slug, "could not load configuration, using virtual layout: {:#}", e);
                self.host
                    .notifier
                    .notify(
                        NoticeLevel::Warning,
                        &format!("Could not load configuration for {decoded_path}: {e:#}"),
                    )
                    .await;
                Value::Null
            }
        };
        let path = url_path(&config).unwrap_or(decoded_path);
        let metadata = metadata.unwrap_or_else(|e| {
            tracing::debug!(slug, "no parameter metadata: {:#}", e);
            Vec::new()
        });

        let layout = self.store_layout(&config, slug).await?;

        let cache = self.registry.parameter_cache();
        if !cache.has_manual(slug).await {
            let seeded = parameters::discover(&layout)
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| defaults_from_metadata(&metadata));
            if !seeded.is_empty() {
                self.registry.set_parameters(slug, seeded).await;
            }
        }
        let parameters = cache.get(slug).await.unwrap_or_default();

        let sidecar_created = match storage::ensure_parameters_sidecar(&layout, &parameters) {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(slug, "could not create parameters sidecar: {:#}", e);
                false
            }
        };

        let target = RestTarget {
            method: config.get("method").and_then(Value::as_str).map(str::to_string),
            base_url: self.backend.server_url(),
            url_path: Some(path.clone()),
            config_path: config_path(&config),
        };
        if let Err(e) = self.history.initialize_rest_state(slug, target).await {
            tracing::warn!(slug, "could not initialise test state: {:#}", e);
        }

        let shows = layout.entries().into_iter().map(|(facet, address)| async move {
            let slot = facet.slot();
            let result = self.host.panels.show(&address, slot).await;
            if let Err(e) = &result {
                tracing::warn!(slug, %facet, "failed to open facet: {:#}", e);
            }
            FacetPlacement {
                facet,
                address,
                slot,
                opened: result.is_ok(),
                error: result.err().map(|e| format!("{e:#}")),
            }
        });
        let facets = futures::future::join_all(shows).await;

        tracing::info!(slug, path = %path, "opened endpoint");
        Ok(OpenReport {
            slug: slug.to_string(),
            path,
            facets,
            parameters,
            sidecar_created,
        })
    }

    /// Merge `partial` over the current remote configuration and save it.
    /// Returns the merged configuration that was written.
    pub async fn save_config(&self, slug: &str, partial: &Value) -> Result<Value> {
        self.reported("Save configuration", async {
            let partial = partial.as_object().ok_or_else(|| {
                WorkbenchError::invalid_payload("configuration must be a JSON object")
            })?;
            let current = self
                .backend
                .get_endpoint(slug)
                .await
                .context("Failed to read current configuration")?;
            let merged = shallow_merge(&current, partial);
            self.backend.put_endpoint(slug, &merged).await?;

            self.store_layout(&merged, slug).await?;
            self.registry.invalidate_resource(slug).await;
            Ok(merged)
        })
        .await
    }

    pub async fn save_template(&self, slug: &str, template: &str) -> Result<()> {
        self.reported("Save template", async {
            self.backend.put_template(slug, template).await?;
            self.registry.invalidate_resource(slug).await;
            Ok(())
        })
        .await
    }

    pub async fn save_cache(&self, slug: &str, cache: &Value) -> Result<()> {
        self.reported("Save cache configuration", async {
            if !cache.is_object() {
                return Err(WorkbenchError::invalid_payload("cache must be a JSON object").into());
            }
            self.backend.put_cache(slug, cache).await?;
            self.registry.invalidate_resource(slug).await;
            Ok(())
        })
        .await
    }

    pub async fn save_cache_template(&self, slug: &str, template: &str) -> Result<()> {
        self.reported("Save cache template", async {
            self.backend.put_cache_template(slug, template).await?;
            self.registry.invalidate_resource(slug).await;
            Ok(())
        })
        .await
    }

    /// Replace the manual parameter set, persisting it to the sidecar and
    /// the resource's test state.
    pub async fn save_parameters(&self, slug: &str, parameters: ParameterSet) -> Result<()> {
        self.reported("Save parameters", async {
            let layout = self.layout(slug).await?;
            storage::write_parameters_sidecar(&layout, &parameters)?;
            self.registry.set_parameters(slug, parameters.clone()).await;
            if self.history.get_state(slug).await?.is_some() {
                self.history.update_parameters(slug, parameters).await?;
            }
            self.registry.invalidate_resource(slug).await;
            Ok(())
        })
        .await
    }

    pub async fn expand(&self, slug: &str) -> Result<ExpandResponse> {
        self.reported("Expand template", async {
            let params = self.effective_parameters(slug).await?;
            let options = ExpandOptions {
                validate_only: false,
                include_variables: true,
            };
            let response = self.backend.expand_template(slug, &params, options).await?;
            self.host.output.append(&format_expansion(slug, &params, &response)).await;
            Ok(response)
        })
        .await
    }

    /// Run the template with effective parameters and record the run in
    /// the resource's history.
    pub async fn test(&self, slug: &str, limit: Option<u32>) -> Result<TestResponse> {
        self.reported("Test template", async {
            let params = self.effective_parameters(slug).await?;
            let limit = limit.unwrap_or(self.row_limit).max(1);

            let started = Instant::now();
            let response = self.backend.test_template(slug, &params, limit).await?;
            let elapsed = response
                .execution_time_ms
                .unwrap_or_else(|| started.elapsed().as_millis() as u64);

            self.host.output.append(&format_test(slug, &params, &response)).await;

            let record = match &response.error {
                Some(error) => ResponseRecord::failed(elapsed, error.clone()),
                None => {
                    let body = serde_json::to_string_pretty(&json!({
                        "columns": response.columns,
                        "rows": response.rows,
                    }))?;
                    ResponseRecord {
                        status: 200,
                        elapsed_ms: elapsed,
                        size_bytes: body.len() as u64,
                        headers: Default::default(),
                        body,
                        content_type: Some("application/json".to_string()),
                        error: None,
                    }
                }
            };
            self.record_run(slug, params, record).await?;
            Ok(response)
        })
        .await
    }

    async fn record_run(&self, slug: &str, params: ParameterSet, record: ResponseRecord) -> Result<()> {
        let state = match self.history.get_state(slug).await? {
            Some(state) => state,
            None => {
                self.history
                    .initialize_rest_state(slug, RestTarget::default())
                    .await?
            }
        };
        let mut entry = HistoryEntry::from_state(&state, record);
        entry.parameters = params;
        self.history.add_to_history(slug, entry).await?;
        self.registry
            .refresh(&VirtualAddress::new(slug, Facet::Results))
            .await;
        Ok(())
    }

    /// Validate the template and replace its diagnostics with the result.
    /// On a transport failure the published diagnostics are left as they
    /// were.
    pub async fn validate(&self, slug: &str) -> Result<Vec<Diagnostic>> {
        self.reported("Validate template", async {
            let layout = self.layout(slug).await?;
            let params = self.parameters.effective_parameters(slug, Some(&layout)).await;
            let options = ExpandOptions {
                validate_only: true,
                include_variables: false,
            };
            let response = self.backend.expand_template(slug, &params, options).await?;

            let diagnostics = diagnostics::from_validation(&response);
            let document = layout.address(Facet::Template).document_id();
            self.host
                .diagnostics
                .replace(&document, diagnostics.clone())
                .await;
            Ok(diagnostics)
        })
        .await
    }

    /// Call the live endpoint with the resource's test state.
    pub async fn execute_rest(&self, slug: &str) -> Result<HistoryEntry> {
        self.reported("Execute request", async {
            let state = match self.history.get_state(slug).await? {
                Some(state) => state,
                None => {
                    let target = RestTarget {
                        base_url: self.backend.server_url(),
                        ..Default::default()
                    };
                    self.history.initialize_rest_state(slug, target).await?
                }
            };
            let base_url = state
                .connection
                .base_url
                .clone()
                .or_else(|| self.backend.server_url())
                .ok_or_else(|| anyhow::anyhow!("No server URL known for {}", slug))?;
            let path = match &state.connection.url_path {
                Some(path) => path.clone(),
                None => identity::to_path(slug)?,
            };

            let url = executor::endpoint_url(&base_url, &path);
            let defaults = self.history.get_default_headers().await?;
            let record = executor::execute(&self.http, &url, &state, &defaults).await;

            self.host
                .output
                .append(&format!(
                    "{} {} -> {} ({} ms, {} bytes)",
                    state.connection.method.as_deref().unwrap_or("GET"),
                    url,
                    record
                        .error
                        .clone()
                        .unwrap_or_else(|| record.status.to_string()),
                    record.elapsed_ms,
                    record.size_bytes
                ))
                .await;

            let entry = HistoryEntry::from_state(&state, record);
            self.history.add_to_history(slug, entry.clone()).await?;
            self.registry
                .refresh(&VirtualAddress::new(slug, Facet::Results))
                .await;
            Ok(entry)
        })
        .await
    }

    pub async fn refresh_cache(&self, slug: &str) -> Result<Value> {
        self.reported("Refresh cache", async {
            let result = self.backend.refresh_cache(slug).await?;
            self.host
                .output
                .append(&format!("Cache refresh for {slug}: {result}"))
                .await;
            self.registry
                .refresh(&VirtualAddress::new(slug, Facet::Cache))
                .await;
            Ok(result)
        })
        .await
    }

    /// Every resource the backend knows, with `slug` rewritten to the
    /// workbench slug.
    pub async fn list_endpoints(&self) -> Result<Vec<EndpointRef>> {
        self.reported("List endpoints", async {
            let mut endpoints = self.backend.list_endpoints().await?;
            for endpoint in &mut endpoints {
                endpoint.slug = endpoint.resolved_slug();
            }
            Ok(endpoints)
        })
        .await
    }

    /// Fill in missing URL paths of `endpoints` from the backend's list,
    /// matching on the service's slug.
    async fn with_url_paths(&self, mut endpoints: Vec<EndpointRef>) -> Vec<EndpointRef> {
        if endpoints.iter().all(|e| e.url_path.is_some()) {
            return endpoints;
        }
        let listed = match self.backend.list_endpoints().await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::debug!("could not list endpoints for path lookup: {:#}", e);
                return endpoints;
            }
        };
        for endpoint in endpoints.iter_mut().filter(|e| e.url_path.is_none()) {
            endpoint.url_path = listed
                .iter()
                .find(|l| l.slug.is_some() && l.slug == endpoint.slug)
                .and_then(|l| l.url_path.clone());
        }
        endpoints
    }

    /// Open a standalone template file: find the resources that use it,
    /// set up its SQL test state, and open the owning resource when there
    /// is exactly one.
    pub async fn open_template_file(&self, template: &Path) -> Result<TemplateFileReport> {
        self.reported("Open template", async {
            let template = if template.is_absolute() {
                template.to_path_buf()
            } else {
                self.resolver.anchor()?.join(template)
            };

            let endpoints = match self.backend.find_by_template(&template).await {
                Ok(endpoints) => self.with_url_paths(endpoints).await,
                Err(e) => {
                    tracing::warn!(template = %template.display(), "reverse lookup failed: {:#}", e);
                    Vec::new()
                }
            };

            let id = template.display().to_string();
            let config_path = endpoints
                .first()
                .and_then(|e| e.config_file.as_ref())
                .map(PathBuf::from);
            let mut state = self
                .history
                .initialize_sql_state(&id, template.clone(), config_path)
                .await?;
            if state.parameters.is_empty() {
                let discovered = parameters::read_inline_directive(&template)
                    .or_else(|| parameters::read_sidecar(&storage::sidecar_path(&template)));
                if let Some(found) = discovered.filter(|p| !p.is_empty()) {
                    state = self.history.update_parameters(&id, found).await?;
                }
            }

            let slugs: Vec<String> = endpoints.iter().filter_map(EndpointRef::resolved_slug).collect();
            let opened = match slugs.as_slice() {
                [slug] => Some(self.open_inner(slug).await?),
                [] => None,
                many => {
                    self.host
                        .notifier
                        .notify(
                            NoticeLevel::Info,
                            &format!("{} endpoints use {}", many.len(), template.display()),
                        )
                        .await;
                    None
                }
            };

            Ok(TemplateFileReport {
                template_path: template,
                endpoints,
                state,
                opened,
            })
        })
        .await
    }
}

fn config_path(config: &Value) -> Option<PathBuf> {
    CONFIG_PATH_KEYS
        .iter()
        .find_map(|k| config.get(*k).and_then(Value::as_str))
        .map(PathBuf::from)
}

fn url_path(config: &Value) -> Option<String> {
    URL_PATH_KEYS
        .iter()
        .find_map(|k| config.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn defaults_from_metadata(metadata: &[ParameterMeta]) -> ParameterSet {
    let object: serde_json::Map<String, Value> = metadata
        .iter()
        .filter_map(|m| Some((m.name.clone(), m.default.clone()?)))
        .collect();
    parameter_set_from_json(&Value::Object(object)).unwrap_or_default()
}

fn format_parameters(params: &ParameterSet) -> String {
    serde_json::to_string(&parameter_set_to_json(params)).unwrap_or_default()
}

fn format_expansion(slug: &str, params: &ParameterSet, response: &ExpandResponse) -> String {
    let mut out = format!(
        "=== Expand {} ===\nParameters: {}\n\n{}\n",
        slug,
        format_parameters(params),
        response.expanded.as_deref().unwrap_or("")
    );
    for issue in &response.errors {
        out.push_str(&format!("error: {}\n", issue.message));
    }
    for issue in &response.warnings {
        out.push_str(&format!("warning: {}\n", issue.message));
    }
    out
}

fn format_test(slug: &str, params: &ParameterSet, response: &TestResponse) -> String {
    let mut out = format!(
        "=== Test {} ===\nParameters: {}\n",
        slug,
        format_parameters(params)
    );
    if let Some(expanded) = &response.expanded {
        out.push_str(&format!("\n{}\n", expanded));
    }
    match &response.error {
        Some(error) => out.push_str(&format!("\nerror: {}\n", error)),
        None => {
            let count = response.row_count.unwrap_or(response.rows.len() as u64);
            out.push_str(&format!("\n{} row(s)\n", count));
            if let Ok(rows) = serde_json::to_string_pretty(&response.rows) {
                out.push_str(&rows);
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_defaults_skip_missing() {
        let metadata: Vec<ParameterMeta> = serde_json::from_value(json!([
            { "name": "id", "default": 5 },
            { "name": "region", "default": "eu" },
            { "name": "q" }
        ]))
        .unwrap();
        let defaults = defaults_from_metadata(&metadata);
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults.get("id").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_output_mentions_error() {
        let response = TestResponse {
            error: Some("syntax error".into()),
            ..Default::default()
        };
        let text = format_test("orders", &ParameterSet::new(), &response);
        assert!(text.contains("error: syntax error"));
    }
}
