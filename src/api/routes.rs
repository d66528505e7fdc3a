use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::api::handlers::{self, AppState};
use crate::store::QueryRunner;

pub fn create_router<R: QueryRunner + 'static>() -> Router<AppState<R>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Flat (query string) requests
        .route("/:entity", get(handlers::list_documents::<R>))
        .route("/:entity/:id", get(handlers::get_document::<R>))
        // Structured (JSON body) requests
        .route("/:entity/query", post(handlers::query_documents::<R>))
        .route("/:entity/:id/query", post(handlers::query_document::<R>))
        .layer(CorsLayer::permissive())
}
