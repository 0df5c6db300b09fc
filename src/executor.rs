//! Live REST test execution against a configured endpoint.
//!
//! Builds a request from a [`TestState`] (method, parameters, headers,
//! body, auth), sends it, and captures a [`ResponseRecord`] with timing
//! and size. Transport failures are recorded, not raised, so every run
//! lands in history.

use base64::prelude::*;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use std::time::Instant;

use crate::history::{AuthConfig, ResponseRecord, TestState};
use crate::models::{parameter_set_to_json, HeaderSet};

/// Join the server base URL and a resource path.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn sends_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::DELETE
}

fn apply_auth(builder: reqwest::RequestBuilder, auth: &AuthConfig) -> reqwest::RequestBuilder {
    match auth {
        AuthConfig::None => builder,
        AuthConfig::Basic { username, password } => {
            let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
            builder.header(AUTHORIZATION, format!("Basic {encoded}"))
        }
        AuthConfig::Bearer { token } => builder.bearer_auth(token),
        AuthConfig::ApiKey { header, value } => builder.header(header.as_str(), value.as_str()),
    }
}

/// Execute the request described by `state` against `url`.
///
/// `default_headers` are applied first; the state's own headers win on
/// conflicts.
pub async fn execute(
    client: &reqwest::Client,
    url: &str,
    state: &TestState,
    default_headers: &HeaderSet,
) -> ResponseRecord {
    let started = Instant::now();
    let elapsed = || started.elapsed().as_millis() as u64;

    let method_name = state
        .connection
        .method
        .as_deref()
        .unwrap_or("GET")
        .to_ascii_uppercase();
    let method = match Method::from_bytes(method_name.as_bytes()) {
        Ok(method) => method,
        Err(_) => return ResponseRecord::failed(0, format!("invalid HTTP method '{method_name}'")),
    };

    let mut builder = client.request(method.clone(), url);

    let mut headers = default_headers.clone();
    headers.extend(state.headers.clone());
    for (name, value) in &headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::warn!(header = %name, "skipping invalid header"),
        }
    }

    builder = apply_auth(builder, &state.auth);

    if sends_query(&method) {
        let query: Vec<(&String, &String)> = state.parameters.iter().collect();
        builder = builder.query(&query);
    } else if let Some(body) = &state.body {
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        builder = builder.body(body.clone());
    } else {
        builder = builder.json(&parameter_set_to_json(&state.parameters));
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url, "test request failed: {}", e);
            return ResponseRecord::failed(elapsed(), e.to_string());
        }
    };

    let status = response.status().as_u16();
    let response_headers: HeaderSet = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let content_type = response_headers.get("content-type").cloned();

    match response.bytes().await {
        Ok(bytes) => ResponseRecord {
            status,
            elapsed_ms: elapsed(),
            size_bytes: bytes.len() as u64,
            headers: response_headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            content_type,
            error: None,
        },
        Err(e) => {
            let mut record = ResponseRecord::failed(elapsed(), e.to_string());
            record.status = status;
            record.headers = response_headers;
            record
        }
    }
}
