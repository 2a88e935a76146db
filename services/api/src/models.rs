//! API Models
//!
//! Request and response bodies of the one-shot endpoints, annotated for the
//! OpenAPI document. They mirror the gateway wire types of `mari-core`.

use mari_core::models::{DocumentPayload, HistoryEntry, MessageRole};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Model => MessageRole::Model,
        }
    }
}

/// A page image as base64 plus its media type.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct DocumentBody {
    #[schema(example = "iVBORw0KGgo...")]
    pub data: String,
    #[serde(rename = "type")]
    #[schema(example = "image/png")]
    pub media_type: String,
}

impl From<DocumentBody> for DocumentPayload {
    fn from(body: DocumentBody) -> Self {
        Self {
            data: body.data,
            media_type: body.media_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HistoryItem {
    pub role: Role,
    pub text: String,
}

impl From<HistoryItem> for HistoryEntry {
    fn from(item: HistoryItem) -> Self {
        Self {
            role: item.role.into(),
            text: item.text,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnalyzePayload {
    pub document: Option<DocumentBody>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatPayload {
    #[schema(example = "Was bedeutet 'der Bahnhof'?")]
    pub message: Option<String>,
    pub document: Option<DocumentBody>,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TextResponse {
    pub text: String,
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "Chat failed")]
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_payload_deserialization() {
        let json = r#"{
            "message": "Hallo",
            "document": { "data": "QUJD", "type": "image/jpeg" },
            "history": [{ "role": "model", "text": "Willkommen" }]
        }"#;
        let payload: ChatPayload = serde_json::from_str(json).unwrap();

        assert_eq!(payload.message.as_deref(), Some("Hallo"));
        let document: DocumentPayload = payload.document.unwrap().into();
        assert_eq!(document.media_type, "image/jpeg");
        let entry: HistoryEntry = payload.history[0].clone().into();
        assert_eq!(entry.role, MessageRole::Model);
    }

    #[test]
    fn test_chat_payload_history_defaults_to_empty() {
        let payload: ChatPayload = serde_json::from_str(r#"{"message":"Hi"}"#).unwrap();
        assert!(payload.history.is_empty());
        assert!(payload.document.is_none());
    }

    #[test]
    fn test_invalid_role_rejected() {
        let result: Result<HistoryItem, _> =
            serde_json::from_str(r#"{"role":"assistant","text":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_string(&TextResponse {
            text: "Gut!".to_string(),
            success: true,
        })
        .unwrap();
        assert_eq!(ok, r#"{"text":"Gut!","success":true}"#);

        let err = serde_json::to_string(&ErrorResponse {
            error: "Chat failed".to_string(),
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(err, r#"{"error":"Chat failed","message":"boom"}"#);
    }
}
