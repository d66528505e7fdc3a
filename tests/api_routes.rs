use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use docbase_api::logic::SqlQuery;
use docbase_api::routes::create_router;
use docbase_api::{MemoryRunner, QueryEngine, Registry, Row};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const REGISTRY: &str = include_str!("fixtures/registry.json");

fn app<F>(handler: F) -> Router
where
    F: Fn(&SqlQuery) -> anyhow::Result<Vec<Row>> + Send + Sync + 'static,
{
    let registry = Registry::from_json(REGISTRY).unwrap();
    let engine = QueryEngine::new(Arc::new(registry), Arc::new(MemoryRunner::new(handler)));
    create_router::<MemoryRunner>().with_state(Arc::new(engine))
}

fn cabins(query: &SqlQuery) -> anyhow::Result<Vec<Row>> {
    let value = if query.sql.contains("COUNT(DISTINCT") {
        json!({ "count": 1 })
    } else {
        json!({ "id": "00000000-0000-4000-8000-000000000001", "name": "Skåla" })
    };
    Ok(value.as_object().cloned().into_iter().collect())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (status, body) = send(app(cabins), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_list_documents() {
    let (status, body) = send(app(cabins), get("/cabin?fields=name&name=%7Esk")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "count": 1, "limit": 20, "offset": 0, "documents": [{ "name": "Skåla" }] })
    );
}

#[tokio::test]
async fn test_invalid_parameters_are_bad_request() {
    let (status, body) = send(app(cabins), get("/cabin?limit=abc&colour=red")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let errors: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&"Invalid parameter 'limit': must be an integer between 0 and 50"));
    assert!(errors.iter().any(|e| e.starts_with("Invalid parameter 'colour'")));
}

#[tokio::test]
async fn test_unknown_entity_is_not_found() {
    let (status, body) = send(app(cabins), get("/boat")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("boat"));
}

#[tokio::test]
async fn test_missing_document_is_not_found() {
    let app = app(|_| Ok(Vec::new()));
    let (status, body) = send(app, get("/cabin/00000000-0000-4000-8000-000000000001")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Document not found");
}

#[tokio::test]
async fn test_malformed_identifier_is_bad_request() {
    let (status, body) = send(app(cabins), get("/cabin/42")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_structured_query() {
    let request = post(
        "/cabin/query",
        json!({ "fields": ["name"], "filters": [["name", "~sk"]], "limit": 5 }),
    );
    let (status, body) = send(app(cabins), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["documents"], json!([{ "name": "Skåla" }]));
}

#[tokio::test]
async fn test_structured_point_lookup() {
    let request = post(
        "/cabin/00000000-0000-4000-8000-000000000001/query",
        json!({ "fields": ["name"] }),
    );
    let (status, body) = send(app(cabins), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "name": "Skåla" }));
}

#[tokio::test]
async fn test_store_failure_is_internal_error() {
    let app = app(|_| Err(anyhow::anyhow!("connection refused")));
    let (status, body) = send(app, get("/cabin")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.get("errors").is_none());
}
