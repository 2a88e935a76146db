//! Conversation Data Model
//!
//! Sessions own an ordered list of documents, and every document owns its own
//! chat thread. The serialized shape matches the persisted state blob, so these
//! types are used both in memory and on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Title given to freshly created sessions.
pub const DEFAULT_SESSION_TITLE: &str = "Neue Sitzung";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Model => write!(f, "model"),
        }
    }
}

/// A single chat message. Messages are append-only and belong to one document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub text: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Model, text)
    }
}

/// An uploaded lesson page together with its chat thread.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    /// Original file name of the upload.
    pub name: String,
    /// Clean title such as "Lektion 1".
    pub display_name: String,
    #[serde(rename = "type")]
    pub media_type: String,
    /// Base64 encoded image payload.
    pub data: String,
    pub messages: Vec<Message>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Document {
    /// Creates a document whose thread starts with the scanning greeting.
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        media_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let greeting = Message::model(format!(
            "Hallo! Ich scanne \"{}\" jetzt ganz genau für dich ein...",
            name
        ));
        Self {
            id: Uuid::new_v4(),
            name,
            display_name: display_name.into(),
            media_type: media_type.into(),
            data: data.into(),
            messages: vec![greeting],
            timestamp: Utc::now(),
        }
    }

    /// The image as sent to the one-shot gateway calls.
    pub fn payload(&self) -> DocumentPayload {
        DocumentPayload {
            data: self.data.clone(),
            media_type: self.media_type.clone(),
        }
    }

    /// The thread as an ordered, role-tagged history.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.messages.iter().map(HistoryEntry::from).collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    pub documents: Vec<Document>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            documents: Vec::new(),
            created_at: now,
            last_active: now,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Document as carried in the analysis and chat request bodies.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DocumentPayload {
    pub data: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

/// One prior turn as carried in the chat request body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub text: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            text: message.text.clone(),
        }
    }
}
