//! UI message dispatch.
//!
//! [`WorkbenchMessages`] is the [`MessageHandler`] behind the correlation
//! channel: a switch over the message type where each arm performs one
//! backend call or one local operation.
//!
//! | Type | Payload | Result |
//! |------|---------|--------|
//! | `openEndpoint` | `{path}` or `{slug}` | open report |
//! | `openTemplateFile` | `{path}` | template file report |
//! | `readDocument` | `{uri}` | `{content, unknown}` |
//! | `getConfig` / `saveConfig` | `{slug}` / `{slug, config}` | configuration |
//! | `getTemplate` / `saveTemplate` | `{slug}` / `{slug, template}` | `{template}` |
//! | `getCache` / `saveCache` | `{slug}` / `{slug, cache}` | cache configuration |
//! | `getCacheTemplate` / `saveCacheTemplate` | `{slug}` / `{slug, template}` | `{template}` |
//! | `getParameters` / `setParameters` | `{slug}` / `{slug, parameters}` | `{parameters, effective}` |
//! | `expandTemplate` | `{slug}` | expansion |
//! | `testTemplate` | `{slug, limit?}` | rows, columns or error |
//! | `validateTemplate` | `{slug}` | `{diagnostics}` |
//! | `refreshCache` | `{slug}` | backend answer |
//! | `listEndpoints` | none | `{endpoints}` |
//! | `getTestState` | `{id}` | state or `null` |
//! | `updateParameters` / `updateHeaders` / `updateBody` / `updateAuth` | `{id, value}` | state |
//! | `clearHistory` | `{id}` | state |
//! | `executeRequest` | `{slug}` | history entry |
//! | `getDefaultHeaders` / `setDefaultHeaders` | none / `{headers}` | headers |

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::channel::MessageHandler;
use crate::error::WorkbenchError;
use crate::history::AuthConfig;
use crate::models::{parameter_set_from_json, parameter_set_to_json, HeaderSet, ParameterSet};
use crate::orchestrator::Workbench;

pub struct WorkbenchMessages {
    workbench: Arc<Workbench>,
}

impl WorkbenchMessages {
    pub fn new(workbench: Arc<Workbench>) -> Self {
        Self { workbench }
    }
}

fn str_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| WorkbenchError::invalid_payload(format!("missing string field '{name}'")).into())
}

fn field<'a>(payload: &'a Value, name: &str) -> Result<&'a Value> {
    payload
        .get(name)
        .ok_or_else(|| WorkbenchError::invalid_payload(format!("missing field '{name}'")).into())
}

fn typed_field<T: DeserializeOwned>(payload: &Value, name: &str) -> Result<T> {
    serde_json::from_value(field(payload, name)?.clone())
        .map_err(|e| WorkbenchError::invalid_payload(format!("field '{name}': {e}")).into())
}

fn parameter_field(payload: &Value, name: &str) -> Result<ParameterSet> {
    parameter_set_from_json(field(payload, name)?).ok_or_else(|| {
        WorkbenchError::invalid_payload(format!("field '{name}' must be an object")).into()
    })
}

#[async_trait]
impl MessageHandler for WorkbenchMessages {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value> {
        let wb = &self.workbench;
        let backend = wb.backend();
        let history = wb.history();

        let result = match kind {
            "openEndpoint" => {
                let report = match payload.get("slug").and_then(Value::as_str) {
                    Some(slug) => wb.open_slug(slug).await?,
                    None => wb.open(str_field(&payload, "path")?).await?,
                };
                serde_json::to_value(report)?
            }
            "openTemplateFile" => {
                let path = str_field(&payload, "path")?;
                serde_json::to_value(wb.open_template_file(Path::new(path)).await?)?
            }
            "readDocument" => {
                let content = wb.registry().read_uri(str_field(&payload, "uri")?).await;
                json!({ "content": content.text(), "unknown": content.is_unknown() })
            }

            "getConfig" => backend.get_endpoint(str_field(&payload, "slug")?).await?,
            "saveConfig" => {
                let slug = str_field(&payload, "slug")?;
                wb.save_config(slug, field(&payload, "config")?).await?
            }
            "getTemplate" => {
                json!({ "template": backend.get_template(str_field(&payload, "slug")?).await? })
            }
            "saveTemplate" => {
                let slug = str_field(&payload, "slug")?;
                wb.save_template(slug, str_field(&payload, "template")?).await?;
                json!({ "success": true })
            }
            "getCache" => backend.get_cache(str_field(&payload, "slug")?).await?,
            "saveCache" => {
                let slug = str_field(&payload, "slug")?;
                wb.save_cache(slug, field(&payload, "cache")?).await?;
                json!({ "success": true })
            }
            "getCacheTemplate" => {
                let slug = str_field(&payload, "slug")?;
                json!({ "template": backend.get_cache_template(slug).await? })
            }
            "saveCacheTemplate" => {
                let slug = str_field(&payload, "slug")?;
                wb.save_cache_template(slug, str_field(&payload, "template")?).await?;
                json!({ "success": true })
            }

            "getParameters" => {
                let slug = str_field(&payload, "slug")?;
                let manual = wb.registry().parameters(slug).await.unwrap_or_default();
                let effective = wb.effective_parameters(slug).await?;
                json!({
                    "parameters": parameter_set_to_json(&manual),
                    "effective": parameter_set_to_json(&effective),
                })
            }
            "clearParameters" => {
                let slug = str_field(&payload, "slug")?;
                wb.registry().clear_parameters(slug).await;
                let effective = wb.effective_parameters(slug).await?;
                json!({ "effective": parameter_set_to_json(&effective) })
            }
            "setParameters" => {
                let slug = str_field(&payload, "slug")?;
                let parameters = parameter_field(&payload, "parameters")?;
                wb.save_parameters(slug, parameters.clone()).await?;
                json!({ "parameters": parameter_set_to_json(&parameters) })
            }

            "expandTemplate" => {
                serde_json::to_value(wb.expand(str_field(&payload, "slug")?).await?)?
            }
            "testTemplate" => {
                let slug = str_field(&payload, "slug")?;
                let limit = payload
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l.min(u32::MAX as u64) as u32);
                serde_json::to_value(wb.test(slug, limit).await?)?
            }
            "validateTemplate" => {
                let diagnostics = wb.validate(str_field(&payload, "slug")?).await?;
                json!({ "diagnostics": diagnostics })
            }
            "refreshCache" => wb.refresh_cache(str_field(&payload, "slug")?).await?,
            "listEndpoints" => json!({ "endpoints": wb.list_endpoints().await? }),

            "getTestState" => serde_json::to_value(history.get_state(str_field(&payload, "id")?).await?)?,
            "updateParameters" => {
                let id = str_field(&payload, "id")?;
                serde_json::to_value(history.update_parameters(id, parameter_field(&payload, "value")?).await?)?
            }
            "updateHeaders" => {
                let id = str_field(&payload, "id")?;
                let headers: HeaderSet = typed_field(&payload, "value")?;
                serde_json::to_value(history.update_headers(id, headers).await?)?
            }
            "updateBody" => {
                let id = str_field(&payload, "id")?;
                let body: Option<String> = typed_field(&payload, "value")?;
                serde_json::to_value(history.update_body(id, body).await?)?
            }
            "updateAuth" => {
                let id = str_field(&payload, "id")?;
                let auth: AuthConfig = typed_field(&payload, "value")?;
                serde_json::to_value(history.update_auth_config(id, auth).await?)?
            }
            "deleteTestState" => {
                json!({ "deleted": history.delete_state(str_field(&payload, "id")?).await? })
            }
            "clearHistory" => serde_json::to_value(history.clear_history(str_field(&payload, "id")?).await?)?,
            "executeRequest" => {
                serde_json::to_value(wb.execute_rest(str_field(&payload, "slug")?).await?)?
            }
            "getDefaultHeaders" => serde_json::to_value(history.get_default_headers().await?)?,
            "setDefaultHeaders" => {
                let headers: HeaderSet = typed_field(&payload, "headers")?;
                history.set_default_headers(&headers).await?;
                serde_json::to_value(headers)?
            }

            other => anyhow::bail!("unknown message type '{}'", other),
        };
        Ok(result)
    }
}
