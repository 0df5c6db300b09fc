//! Integration tests for `HttpBackend` against a mock configuration
//! service served by axum on an ephemeral port.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use endpoint_workbench::backend::{ConfigBackend, ExpandOptions, HttpBackend};
use endpoint_workbench::config::BackendConfig;
use endpoint_workbench::error::WorkbenchError;
use endpoint_workbench::models::ParameterSet;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const TOKEN: &str = "secret-token";

#[derive(Default)]
struct Mock {
    configs: Mutex<HashMap<String, Value>>,
    puts: Mutex<Vec<(String, Value)>>,
    expand_queries: Mutex<Vec<HashMap<String, String>>>,
    flaky_failures_left: AtomicUsize,
    flaky_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

type Shared = Arc<Mock>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn list_endpoints(State(mock): State<Shared>) -> Json<Value> {
    let configs = mock.configs.lock().unwrap();
    let endpoints: Vec<Value> = configs.values().cloned().collect();
    Json(json!({ "endpoints": endpoints }))
}

async fn get_endpoint(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }
    if slug == "flaky" {
        mock.flaky_calls.fetch_add(1, Ordering::SeqCst);
        let left = mock.flaky_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            mock.flaky_failures_left.store(left - 1, Ordering::SeqCst);
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "warming up" })));
        }
        return (StatusCode::OK, Json(json!({ "url-path": "/flaky" })));
    }
    match mock.configs.lock().unwrap().get(&slug) {
        Some(config) => (StatusCode::OK, Json(config.clone())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": format!("no endpoint {slug}") } })),
        ),
    }
}

async fn put_endpoint(
    State(mock): State<Shared>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    mock.put_calls.fetch_add(1, Ordering::SeqCst);
    if slug == "broken" {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "disk full" })));
    }
    mock.puts.lock().unwrap().push((slug.clone(), body.clone()));
    mock.configs.lock().unwrap().insert(slug, body);
    (StatusCode::OK, Json(json!({ "success": true })))
}

async fn get_template(Path(slug): Path<String>) -> impl IntoResponse {
    if slug == "plain" {
        return "SELECT * FROM plain".into_response();
    }
    Json(json!({ "template": format!("SELECT * FROM {slug}") })).into_response()
}

async fn put_template(
    State(mock): State<Shared>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    mock.puts.lock().unwrap().push((format!("{slug}/template"), body));
    StatusCode::NO_CONTENT
}

async fn expand(
    State(mock): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let validate_only = query.get("validate_only").map(String::as_str) == Some("true");
    mock.expand_queries.lock().unwrap().push(query);
    if validate_only {
        Json(json!({
            "valid": false,
            "errors": [{ "message": "bad column", "line": 2, "column": 5 }],
            "warnings": []
        }))
    } else {
        Json(json!({
            "expanded": format!("SELECT * FROM t WHERE id = {}", body["parameters"]["id"].as_str().unwrap_or("?")),
            "variables": { "id": body["parameters"]["id"].clone() }
        }))
    }
}

async fn test_template(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "success": true,
        "columns": ["id"],
        "rows": [{ "id": 1 }, { "id": 2 }],
        "rowCount": 2,
        "limit": body["limit"].clone()
    }))
}

async fn parameters() -> Json<Value> {
    Json(json!([{ "name": "id", "default": "1" }, { "field-name": "region" }]))
}

async fn by_template(Json(body): Json<Value>) -> Json<Value> {
    let path = body["template_path"].as_str().unwrap_or_default();
    if path.ends_with("customers.sql") {
        Json(json!([{ "url-path": "/customers/" }]))
    } else {
        Json(json!({ "endpoints": [] }))
    }
}

async fn refresh_cache(Path(slug): Path<String>) -> Json<Value> {
    Json(json!({ "refreshed": slug }))
}

async fn start_mock() -> (String, Shared) {
    let mock = Arc::new(Mock::default());
    mock.configs.lock().unwrap().insert(
        "customers".to_string(),
        json!({ "url-path": "/customers", "method": "GET" }),
    );

    let app = Router::new()
        .route("/api/v1/_config/endpoints", get(list_endpoints))
        .route("/api/v1/_config/endpoints/by-template", post(by_template))
        .route(
            "/api/v1/_config/endpoints/{slug}",
            get(get_endpoint).put(put_endpoint),
        )
        .route(
            "/api/v1/_config/endpoints/{slug}/template",
            get(get_template).put(put_template),
        )
        .route("/api/v1/_config/endpoints/{slug}/template/expand", post(expand))
        .route("/api/v1/_config/endpoints/{slug}/template/test", post(test_template))
        .route("/api/v1/_config/endpoints/{slug}/parameters", get(parameters))
        .route("/api/v1/_config/endpoints/{slug}/cache/refresh", post(refresh_cache))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), mock)
}

fn client(base_url: &str, max_retries: u32) -> HttpBackend {
    HttpBackend::new(&BackendConfig {
        base_url: base_url.to_string(),
        token: Some(TOKEN.to_string()),
        timeout_secs: 5,
        max_retries,
    })
    .unwrap()
}

#[tokio::test]
async fn config_round_trip_with_bearer_token() {
    let (url, mock) = start_mock().await;
    let backend = client(&url, 0);

    let config = backend.get_endpoint("customers").await.unwrap();
    assert_eq!(config["method"], "GET");

    let updated = json!({ "url-path": "/customers", "method": "POST" });
    backend.put_endpoint("customers", &updated).await.unwrap();
    assert_eq!(backend.get_endpoint("customers").await.unwrap(), updated);
    assert_eq!(mock.puts.lock().unwrap().len(), 1);
    assert_eq!(backend.server_url().as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let (url, _mock) = start_mock().await;
    let backend = HttpBackend::new(&BackendConfig {
        base_url: url,
        token: None,
        timeout_secs: 5,
        max_retries: 0,
    })
    .unwrap();

    let err = backend.get_endpoint("customers").await.unwrap_err();
    let backend_err = err.downcast_ref::<WorkbenchError>().unwrap();
    assert!(matches!(backend_err, WorkbenchError::Backend { status: 401, .. }));
}

#[tokio::test]
async fn not_found_carries_backend_message() {
    let (url, _mock) = start_mock().await;
    let err = client(&url, 0).get_endpoint("ghost").await.unwrap_err();
    let backend_err = err.downcast_ref::<WorkbenchError>().unwrap();
    assert!(backend_err.is_not_found());
    assert!(backend_err.to_string().contains("no endpoint ghost"));
}

#[tokio::test]
async fn gets_retry_on_server_errors() {
    let (url, mock) = start_mock().await;
    mock.flaky_failures_left.store(1, Ordering::SeqCst);

    let config = client(&url, 2).get_endpoint("flaky").await.unwrap();
    assert_eq!(config["url-path"], "/flaky");
    assert_eq!(mock.flaky_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn gets_give_up_after_max_retries() {
    let (url, mock) = start_mock().await;
    mock.flaky_failures_left.store(10, Ordering::SeqCst);

    let err = client(&url, 1).get_endpoint("flaky").await.unwrap_err();
    assert!(err.to_string().contains("503"));
    assert_eq!(mock.flaky_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn writes_are_not_retried() {
    let (url, mock) = start_mock().await;
    let err = client(&url, 3)
        .put_endpoint("broken", &json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert_eq!(mock.put_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn templates_in_both_shapes() {
    let (url, mock) = start_mock().await;
    let backend = client(&url, 0);

    assert_eq!(
        backend.get_template("customers").await.unwrap(),
        "SELECT * FROM customers"
    );
    assert_eq!(backend.get_template("plain").await.unwrap(), "SELECT * FROM plain");

    backend.put_template("customers", "SELECT 1").await.unwrap();
    let puts = mock.puts.lock().unwrap();
    assert_eq!(puts[0], ("customers/template".to_string(), json!({ "template": "SELECT 1" })));
}

#[tokio::test]
async fn expand_and_validate_flags() {
    let (url, mock) = start_mock().await;
    let backend = client(&url, 0);
    let mut params = ParameterSet::new();
    params.insert("id".into(), "42".into());

    let expanded = backend
        .expand_template(
            "customers",
            &params,
            ExpandOptions {
                validate_only: false,
                include_variables: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(expanded.expanded.as_deref(), Some("SELECT * FROM t WHERE id = 42"));

    let validated = backend
        .expand_template(
            "customers",
            &params,
            ExpandOptions {
                validate_only: true,
                include_variables: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(validated.errors.len(), 1);
    assert_eq!(validated.errors[0].position.unwrap().line, 2);

    let queries = mock.expand_queries.lock().unwrap();
    assert_eq!(queries[0].get("include_variables").map(String::as_str), Some("true"));
    assert!(queries[0].get("validate_only").is_none());
    assert_eq!(queries[1].get("validate_only").map(String::as_str), Some("true"));
}

#[tokio::test]
async fn test_parameters_lookup_and_listing() {
    let (url, _mock) = start_mock().await;
    let backend = client(&url, 0);

    let result = backend
        .test_template("customers", &ParameterSet::new(), 25)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.row_count, Some(2));
    assert_eq!(result.rows.len(), 2);

    let meta = backend.get_parameters("customers").await.unwrap();
    assert_eq!(meta.len(), 2);
    assert_eq!(meta[1].name, "region");
    assert!(meta[1].default.is_none());

    let owners = backend
        .find_by_template(std::path::Path::new("/w/sqls/customers.sql"))
        .await
        .unwrap();
    assert_eq!(owners[0].resolved_slug().as_deref(), Some("customers-slash"));
    assert!(backend
        .find_by_template(std::path::Path::new("/w/other.sql"))
        .await
        .unwrap()
        .is_empty());

    let listed = backend.list_endpoints().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].url_path.as_deref(), Some("/customers"));

    let refreshed = backend.refresh_cache("customers").await.unwrap();
    assert_eq!(refreshed["refreshed"], "customers");
}

#[tokio::test]
async fn hyphenated_resources_use_the_service_slug() {
    let (url, mock) = start_mock().await;
    mock.configs.lock().unwrap().insert(
        "customer-orders".to_string(),
        json!({ "url-path": "/customer-orders", "method": "GET" }),
    );
    let backend = client(&url, 0);

    let config = backend.get_endpoint("customer~2Dorders").await.unwrap();
    assert_eq!(config["url-path"], "/customer-orders");

    backend
        .put_endpoint("customer~2Dorders", &json!({ "url-path": "/customer-orders", "method": "POST" }))
        .await
        .unwrap();
    assert_eq!(mock.puts.lock().unwrap()[0].0, "customer-orders");

    let refreshed = backend.refresh_cache("customer~2Dorders").await.unwrap();
    assert_eq!(refreshed, json!({ "refreshed": "customer-orders" }));
}
