//! Axum Handlers for the REST API
//!
//! The two one-shot lesson calls. Each forwards to the configured gateway and
//! reports failures as JSON instead of retrying.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use mari_core::models::{DocumentPayload, HistoryEntry};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{AnalyzePayload, ChatPayload, ErrorResponse, TextResponse},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    /// The upstream model call failed; `0` names the operation.
    Upstream(&'static str, anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: message.clone(),
                    message,
                }),
            )
                .into_response(),
            ApiError::Upstream(operation, err) => {
                error!(operation, "Upstream call failed: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: operation.to_string(),
                        message: err.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Produce the initial written analysis of an uploaded page.
#[utoipa::path(
    post,
    path = "/api/analyze",
    request_body = AnalyzePayload,
    responses(
        (status = 200, description = "Analysis text", body = TextResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Analysis failed", body = ErrorResponse)
    )
)]
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnalyzePayload>,
) -> Result<Json<TextResponse>, ApiError> {
    let document: DocumentPayload = payload
        .document
        .ok_or_else(|| ApiError::BadRequest("Document is required".to_string()))?
        .into();
    info!(media_type = %document.media_type, "Analyzing document");

    let text = state
        .gateway
        .analyze_document(&document)
        .await
        .map_err(|e| ApiError::Upstream("Analysis failed", e))?;

    Ok(Json(TextResponse {
        text,
        success: true,
    }))
}

/// Answer one chat turn about a page, given the prior turns of its thread.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatPayload,
    responses(
        (status = 200, description = "Reply text", body = TextResponse),
        (status = 400, description = "Message is required", body = ErrorResponse),
        (status = 500, description = "Chat failed", body = ErrorResponse)
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatPayload>,
) -> Result<Json<TextResponse>, ApiError> {
    let message = payload
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Message is required".to_string()))?;
    let document: DocumentPayload = payload
        .document
        .map(Into::into)
        .unwrap_or_else(|| DocumentPayload {
            data: String::new(),
            media_type: String::new(),
        });
    let history: Vec<HistoryEntry> = payload.history.into_iter().map(Into::into).collect();
    info!(turns = history.len(), "Answering chat turn");

    let text = state
        .gateway
        .chat_turn(&message, &document, &history)
        .await
        .map_err(|e| ApiError::Upstream("Chat failed", e))?;

    Ok(Json(TextResponse {
        text,
        success: true,
    }))
}

#[cfg(test)]
mod tests {
    use crate::{config::Config, router::create_router, state::AppState};
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use mari_core::gateway::LessonGateway;
    use mari_core::models::{DocumentPayload, HistoryEntry, MessageRole};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    /// Records what it was asked and answers with a fixed reply or failure.
    #[derive(Default)]
    struct StubGateway {
        fail: bool,
        seen: Mutex<Vec<(String, DocumentPayload, Vec<HistoryEntry>)>>,
    }

    #[async_trait]
    impl LessonGateway for StubGateway {
        async fn analyze_document(&self, document: &DocumentPayload) -> Result<String> {
            if self.fail {
                return Err(anyhow!("upstream down"));
            }
            Ok(format!("Analyse von {}", document.media_type))
        }

        async fn chat_turn(
            &self,
            message: &str,
            document: &DocumentPayload,
            history: &[HistoryEntry],
        ) -> Result<String> {
            self.seen.lock().unwrap().push((
                message.to_string(),
                document.clone(),
                history.to_vec(),
            ));
            if self.fail {
                return Err(anyhow!("upstream down"));
            }
            Ok("Sehr gut!".to_string())
        }
    }

    fn app(gateway: Arc<StubGateway>) -> axum::Router {
        let config = Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            gemini_api_key: "test".to_string(),
            chat_model: "test-model".to_string(),
            log_level: tracing::Level::INFO,
            prompts_path: "./prompts".into(),
        };
        create_router(Arc::new(AppState {
            gateway,
            config: Arc::new(config),
        }))
    }

    async fn post(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_chat_success() {
        let gateway = Arc::new(StubGateway::default());
        let (status, body) = post(
            app(gateway.clone()),
            "/api/chat",
            json!({
                "message": "Was heißt das?",
                "document": { "data": "QUJD", "type": "image/png" },
                "history": [{ "role": "model", "text": "Hallo!" }]
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "text": "Sehr gut!", "success": true }));

        let seen = gateway.seen.lock().unwrap();
        let (message, document, history) = &seen[0];
        assert_eq!(message, "Was heißt das?");
        assert_eq!(document.data, "QUJD");
        assert_eq!(history[0].role, MessageRole::Model);
    }

    #[tokio::test]
    async fn test_chat_requires_message() {
        for body in [json!({}), json!({ "message": "   " })] {
            let gateway = Arc::new(StubGateway::default());
            let (status, body) = post(app(gateway.clone()), "/api/chat", body).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "Message is required");
            assert!(gateway.seen.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_chat_failure_reports_error() {
        let gateway = Arc::new(StubGateway {
            fail: true,
            ..Default::default()
        });
        let (status, body) = post(app(gateway), "/api/chat", json!({ "message": "Hi" })).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Chat failed");
        assert_eq!(body["message"], "upstream down");
    }

    #[tokio::test]
    async fn test_analyze_success_and_failure() {
        let document = json!({ "document": { "data": "QUJD", "type": "image/jpeg" } });

        let (status, body) = post(
            app(Arc::new(StubGateway::default())),
            "/api/analyze",
            document.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "Analyse von image/jpeg");

        let failing = Arc::new(StubGateway {
            fail: true,
            ..Default::default()
        });
        let (status, body) = post(app(failing), "/api/analyze", document).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Analysis failed");
    }

    #[tokio::test]
    async fn test_non_post_is_rejected() {
        let request = Request::builder()
            .method("GET")
            .uri("/api/chat")
            .body(Body::empty())
            .unwrap();
        let response = app(Arc::new(StubGateway::default()))
            .oneshot(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
