use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use log::error;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::EngineError;
use crate::logic::engine::QueryEngine;
use crate::model::RawRequest;
use crate::store::QueryRunner;

pub type AppState<R> = Arc<QueryEngine<R>>;

pub type ApiResult = Result<Json<Value>, (StatusCode, Json<ErrorResponse>)>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// One entry per rejected request parameter.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
            errors: Vec::new(),
        }
    }
}

fn error_response(err: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        EngineError::Validation(errors) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: err.to_string(),
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        ),
        EngineError::UnknownEntity(_) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse::new(&err.to_string())))
        }
        _ => {
            error!("Request failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(&err.to_string())),
            )
        }
    }
}

fn respond(result: Result<Value, EngineError>) -> ApiResult {
    result.map(Json).map_err(error_response)
}

/// A point lookup that matched nothing is a 404, not a `null` body.
fn respond_single(result: Result<Value, EngineError>) -> ApiResult {
    match result {
        Ok(Value::Null) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Document not found")),
        )),
        other => respond(other),
    }
}

pub async fn list_documents<R: QueryRunner + 'static>(
    State(engine): State<AppState<R>>,
    Path(entity): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult {
    respond(engine.run(&entity, None, RawRequest::Flat(params)).await)
}

pub async fn get_document<R: QueryRunner + 'static>(
    State(engine): State<AppState<R>>,
    Path((entity, id)): Path<(String, String)>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult {
    respond_single(engine.run(&entity, Some(&id), RawRequest::Flat(params)).await)
}

pub async fn query_documents<R: QueryRunner + 'static>(
    State(engine): State<AppState<R>>,
    Path(entity): Path<String>,
    RequestJson(body): RequestJson<Value>,
) -> ApiResult {
    respond(engine.run(&entity, None, RawRequest::Structured(body)).await)
}

pub async fn query_document<R: QueryRunner + 'static>(
    State(engine): State<AppState<R>>,
    Path((entity, id)): Path<(String, String)>,
    RequestJson(body): RequestJson<Value>,
) -> ApiResult {
    respond_single(engine.run(&entity, Some(&id), RawRequest::Structured(body)).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn test_validation_errors_are_bad_requests() {
        let (status, Json(body)) = error_response(EngineError::Validation(vec![
            ValidationError::new("limit", "must be given exactly once"),
        ]));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body.errors,
            vec!["Invalid parameter 'limit': must be given exactly once"]
        );
    }

    #[test]
    fn test_status_per_error_kind() {
        let (status, _) = error_response(EngineError::UnknownEntity("boat".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = error_response(EngineError::Invariant {
            relation: "owner".into(),
            key: "1".into(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (status, _) = respond_single(Ok(Value::Null)).unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
