//! Conversation Store
//!
//! Holds every session, document and message in memory and rewrites the whole
//! state blob after each change. There is no partial update and no migration
//! format: a blob that cannot be read is replaced by an empty state.

use crate::models::{Document, Message, Session};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Fixed key under which the state blob is stored.
pub const STORAGE_KEY: &str = "deutsch_mit_mari_v5";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StoreError {
    #[error("Session '{0}' not found")]
    SessionNotFound(Uuid),
    #[error("Document '{0}' not found")]
    DocumentNotFound(Uuid),
}

/// A flat key-value blob storage.
pub trait StateStorage: Send + Sync {
    /// Returns the blob stored under `key`, if any.
    fn load(&self, key: &str) -> Option<String>;
    /// Replaces the blob stored under `key`.
    fn save(&self, key: &str, blob: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl StateStorage for FileStorage {
    fn load(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create data directory {:?}", self.dir))?;
        let path = self.path_for(key);
        std::fs::write(&path, blob).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

/// In-memory storage, mostly useful for tests.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(key: &str, blob: &str) -> Self {
        let storage = Self::new();
        if let Ok(mut blobs) = storage.blobs.lock() {
            blobs.insert(key.to_string(), blob.to_string());
        }
        storage
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self, key: &str) -> Option<String> {
        self.blobs.lock().ok()?.get(key).cloned()
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage lock poisoned"))?;
        blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }
}

/// The persisted state blob.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub active_session_id: Option<Uuid>,
}

pub struct ConversationStore {
    storage: Box<dyn StateStorage>,
    state: PersistedState,
}

impl ConversationStore {
    /// Loads the stored state, falling back to an empty one when the blob is
    /// missing or unreadable.
    pub fn open(storage: Box<dyn StateStorage>) -> Self {
        let state = match storage.load(STORAGE_KEY) {
            Some(blob) => match serde_json::from_str::<PersistedState>(&blob) {
                Ok(state) => {
                    info!(sessions = state.sessions.len(), "Loaded conversation state");
                    state
                }
                Err(e) => {
                    warn!(error = %e, "Stored conversation state is corrupt; starting empty");
                    PersistedState::default()
                }
            },
            None => PersistedState::default(),
        };
        Self { storage, state }
    }

    pub fn sessions(&self) -> &[Session] {
        &self.state.sessions
    }

    pub fn active_session_id(&self) -> Option<Uuid> {
        self.state.active_session_id
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.state
            .active_session_id
            .and_then(|id| self.session(id).ok())
    }

    pub fn session(&self, session_id: Uuid) -> Result<&Session, StoreError> {
        self.state
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    pub fn document(&self, session_id: Uuid, document_id: Uuid) -> Result<&Document, StoreError> {
        self.session(session_id)?
            .documents
            .iter()
            .find(|d| d.id == document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))
    }

    /// Creates a new session at the front of the list and makes it active.
    pub fn create_session(&mut self) -> Uuid {
        let session = Session::new();
        let id = session.id;
        self.state.sessions.insert(0, session);
        self.state.active_session_id = Some(id);
        self.persist();
        id
    }

    pub fn rename_session(&mut self, session_id: Uuid, title: &str) -> Result<(), StoreError> {
        self.session_mut(session_id)?.title = title.to_string();
        self.persist();
        Ok(())
    }

    pub fn select_session(&mut self, session_id: Uuid) -> Result<(), StoreError> {
        self.session(session_id)?;
        self.state.active_session_id = Some(session_id);
        self.persist();
        Ok(())
    }

    /// Appends a document to a session and returns its index.
    pub fn add_document(
        &mut self,
        session_id: Uuid,
        document: Document,
    ) -> Result<usize, StoreError> {
        let session = self.session_mut(session_id)?;
        session.documents.push(document);
        session.last_active = Utc::now();
        let index = session.documents.len() - 1;
        self.persist();
        Ok(index)
    }

    pub fn append_message(
        &mut self,
        session_id: Uuid,
        document_id: Uuid,
        message: Message,
    ) -> Result<(), StoreError> {
        let document = self
            .session_mut(session_id)?
            .documents
            .iter_mut()
            .find(|d| d.id == document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        document.messages.push(message);
        self.persist();
        Ok(())
    }

    fn session_mut(&mut self, session_id: Uuid) -> Result<&mut Session, StoreError> {
        self.state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    /// Rewrites the full blob. Failures are logged; memory stays authoritative.
    fn persist(&self) {
        let blob = match serde_json::to_string(&self.state) {
            Ok(blob) => blob,
            Err(e) => {
                error!(error = %e, "Failed to serialize conversation state");
                return;
            }
        };
        if let Err(e) = self.storage.save(STORAGE_KEY, &blob) {
            error!(error = ?e, "Failed to persist conversation state");
        }
    }
}
