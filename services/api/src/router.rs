//! Axum Router Configuration
//!
//! HTTP routing for the lesson endpoints plus the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AnalyzePayload, ChatPayload, DocumentBody, ErrorResponse, HistoryItem, Role, TextResponse,
    },
    state::AppState,
};

use axum::{Router, routing::post};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::analyze, handlers::chat),
    components(
        schemas(AnalyzePayload, ChatPayload, DocumentBody, HistoryItem, Role, TextResponse, ErrorResponse)
    ),
    tags(
        (name = "Mari API", description = "One-shot analysis and chat calls for the Mari tutor")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/chat", post(handlers::chat))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
