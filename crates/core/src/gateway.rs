//! One-shot calls to the remote AI gateway.
//!
//! Both calls are stateless request/response round trips. Nothing here retries;
//! callers decide how a failure is surfaced.

use crate::models::{DocumentPayload, HistoryEntry};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Defines the contract for anything that can analyze a page and answer chat turns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LessonGateway: Send + Sync {
    /// Produces the initial written analysis of an uploaded page.
    async fn analyze_document(&self, document: &DocumentPayload) -> Result<String>;

    /// Answers `message` about `document`, given the prior turns of its thread.
    async fn chat_turn(
        &self,
        message: &str,
        document: &DocumentPayload,
        history: &[HistoryEntry],
    ) -> Result<String>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnalyzeRequest {
    pub document: DocumentPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub document: Option<DocumentPayload>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TextResponse {
    pub text: String,
}

/// A `LessonGateway` that talks to a running `mari-api` server over HTTP.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("API error: {}", status));
        }

        let payload: TextResponse = response
            .json()
            .await
            .context("Gateway response had no text")?;
        Ok(payload.text)
    }
}

#[async_trait]
impl LessonGateway for HttpGateway {
    async fn analyze_document(&self, document: &DocumentPayload) -> Result<String> {
        let body = AnalyzeRequest {
            document: document.clone(),
        };
        self.post("/api/analyze", &body).await
    }

    async fn chat_turn(
        &self,
        message: &str,
        document: &DocumentPayload,
        history: &[HistoryEntry],
    ) -> Result<String> {
        let body = ChatRequest {
            message: message.to_string(),
            document: Some(document.clone()),
            history: history.to_vec(),
        };
        self.post("/api/chat", &body).await
    }
}
