//! Lesson Flow
//!
//! Glues the conversation store to the one-shot gateway calls. Each turn runs
//! in three steps so the store is never held across a network call:
//! [`upload_document`] or [`send_message`] records the turn and returns a
//! [`PendingReply`], [`PendingReply::resolve`] asks the gateway, and
//! [`apply_reply`] appends exactly one model message.

use crate::audio::encode_bytes;
use crate::gateway::LessonGateway;
use crate::models::{Document, DocumentPayload, HistoryEntry, Message};
use crate::store::{ConversationStore, StoreError};
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Shown in the thread when a chat turn fails.
pub const CHAT_FALLBACK: &str = "Es gab ein Problem. Können wir es nochmal versuchen?";

/// Shown in the thread when the initial analysis fails.
pub const ANALYSIS_FALLBACK: &str =
    "Die Analyse hat leider nicht geklappt. Stell mir einfach eine Frage zu dem Dokument.";

#[derive(Debug, Clone)]
enum ReplyRequest {
    Analysis(DocumentPayload),
    Chat {
        text: String,
        payload: DocumentPayload,
        history: Vec<HistoryEntry>,
    },
}

/// A gateway call owed to a document's thread. Owns everything the call
/// needs, so it can run on its own task.
#[derive(Debug, Clone)]
pub struct PendingReply {
    session_id: Uuid,
    document_id: Uuid,
    request: ReplyRequest,
}

/// The model message produced for a [`PendingReply`].
#[derive(Debug, Clone, PartialEq)]
pub struct LessonReply {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub message: Message,
}

impl PendingReply {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Calls the gateway. A failed call becomes the matching fallback text.
    pub async fn resolve(self, gateway: &dyn LessonGateway) -> LessonReply {
        let message = match &self.request {
            ReplyRequest::Analysis(payload) => match gateway.analyze_document(payload).await {
                Ok(analysis) => Message::model(analysis),
                Err(e) => {
                    error!(error = ?e, "Initial analysis failed");
                    Message::model(ANALYSIS_FALLBACK)
                }
            },
            ReplyRequest::Chat {
                text,
                payload,
                history,
            } => match gateway.chat_turn(text, payload, history).await {
                Ok(answer) => Message::model(answer),
                Err(e) => {
                    error!(error = ?e, "Chat turn failed");
                    Message::model(CHAT_FALLBACK)
                }
            },
        };
        LessonReply {
            session_id: self.session_id,
            document_id: self.document_id,
            message,
        }
    }
}

/// Adds an uploaded page to a session. The returned reply requests its
/// initial analysis.
///
/// Returns the pending analysis and the new document's index within the session.
#[instrument(skip(store, bytes), fields(size = bytes.len()))]
pub fn upload_document(
    store: &mut ConversationStore,
    session_id: Uuid,
    filename: &str,
    media_type: &str,
    bytes: &[u8],
) -> Result<(PendingReply, usize), StoreError> {
    let doc_count = store.session(session_id)?.documents.len();
    let document = Document::new(
        filename,
        format!("Lektion {}", doc_count + 1),
        media_type,
        encode_bytes(bytes),
    );
    let document_id = document.id;
    let payload = document.payload();
    let index = store.add_document(session_id, document)?;
    info!(%document_id, index, "Document added; analysis pending");

    let pending = PendingReply {
        session_id,
        document_id,
        request: ReplyRequest::Analysis(payload),
    };
    Ok((pending, index))
}

/// Records one chat turn about a document.
///
/// Blank input is ignored. Otherwise the user message is appended and the
/// returned reply asks the gateway with the thread as it was before that
/// message.
#[instrument(skip(store, text))]
pub fn send_message(
    store: &mut ConversationStore,
    session_id: Uuid,
    document_id: Uuid,
    text: &str,
) -> Result<Option<PendingReply>, StoreError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let (payload, history) = {
        let document = store.document(session_id, document_id)?;
        (document.payload(), document.history())
    };
    store.append_message(session_id, document_id, Message::user(text))?;

    Ok(Some(PendingReply {
        session_id,
        document_id,
        request: ReplyRequest::Chat {
            text: text.to_string(),
            payload,
            history,
        },
    }))
}

/// Appends a resolved reply to its document's thread.
pub fn apply_reply(store: &mut ConversationStore, reply: LessonReply) -> Result<(), StoreError> {
    store.append_message(reply.session_id, reply.document_id, reply.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockLessonGateway;
    use crate::models::MessageRole;
    use crate::store::MemoryStorage;
    use anyhow::anyhow;

    fn store_with_session() -> (ConversationStore, Uuid) {
        let mut store = ConversationStore::open(Box::new(MemoryStorage::new()));
        let session_id = store.create_session();
        (store, session_id)
    }

    async fn upload(
        store: &mut ConversationStore,
        gateway: &MockLessonGateway,
        session_id: Uuid,
        filename: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> (Uuid, usize) {
        let (pending, index) =
            upload_document(store, session_id, filename, media_type, bytes).unwrap();
        let document_id = pending.document_id();
        apply_reply(store, pending.resolve(gateway).await).unwrap();
        (document_id, index)
    }

    async fn say(
        store: &mut ConversationStore,
        gateway: &MockLessonGateway,
        session_id: Uuid,
        document_id: Uuid,
        text: &str,
    ) {
        if let Some(pending) = send_message(store, session_id, document_id, text).unwrap() {
            apply_reply(store, pending.resolve(gateway).await).unwrap();
        }
    }

    #[tokio::test]
    async fn test_upload_names_documents_and_appends_analysis() {
        let (mut store, session_id) = store_with_session();
        let mut gateway = MockLessonGateway::new();
        gateway
            .expect_analyze_document()
            .withf(|doc| doc.media_type == "image/png" && doc.data == "AQID")
            .times(2)
            .returning(|_| Ok("Bild 1 zeigt einen Hund.".to_string()));

        let (first, index) = upload(
            &mut store, &gateway, session_id, "seite1.png", "image/png", &[1, 2, 3],
        )
        .await;
        assert_eq!(index, 0);
        let (_, index) = upload(
            &mut store, &gateway, session_id, "seite2.png", "image/png", &[1, 2, 3],
        )
        .await;
        assert_eq!(index, 1);

        let session = store.session(session_id).unwrap();
        assert_eq!(session.documents[0].display_name, "Lektion 1");
        assert_eq!(session.documents[1].display_name, "Lektion 2");

        let doc = store.document(session_id, first).unwrap();
        assert_eq!(doc.messages.len(), 2);
        assert_eq!(doc.messages[1].text, "Bild 1 zeigt einen Hund.");
    }

    #[tokio::test]
    async fn test_upload_analysis_failure_appends_fallback() {
        let (mut store, session_id) = store_with_session();
        let mut gateway = MockLessonGateway::new();
        gateway
            .expect_analyze_document()
            .returning(|_| Err(anyhow!("503")));

        let (doc_id, _) = upload(
            &mut store, &gateway, session_id, "a.jpg", "image/jpeg", &[0xff],
        )
        .await;

        let doc = store.document(session_id, doc_id).unwrap();
        assert_eq!(doc.messages.last().unwrap().text, ANALYSIS_FALLBACK);
        assert_eq!(doc.messages.last().unwrap().role, MessageRole::Model);
    }

    #[tokio::test]
    async fn test_send_message_appends_user_then_model() {
        let (mut store, session_id) = store_with_session();
        let lektion = Document::new("lektion1.png", "Lektion 1", "image/png", "QUJD");
        let other = Document::new("lektion2.png", "Lektion 2", "image/png", "QUJD");
        let (doc_id, other_id) = (lektion.id, other.id);
        store.add_document(session_id, lektion).unwrap();
        store.add_document(session_id, other).unwrap();

        let mut gateway = MockLessonGateway::new();
        gateway
            .expect_chat_turn()
            .withf(|message, _, history| {
                // History excludes the message being sent.
                message == "Was bedeutet das?"
                    && history.len() == 1
                    && history[0].role == MessageRole::Model
            })
            .times(1)
            .returning(|_, _, _| Ok("Das heißt 'What does that mean?'".to_string()));

        say(&mut store, &gateway, session_id, doc_id, "Was bedeutet das?").await;

        let doc = store.document(session_id, doc_id).unwrap();
        assert_eq!(doc.messages.len(), 3);
        assert_eq!(doc.messages[1].role, MessageRole::User);
        assert_eq!(doc.messages[1].text, "Was bedeutet das?");
        assert_eq!(doc.messages[2].role, MessageRole::Model);
        assert_eq!(doc.messages[2].text, "Das heißt 'What does that mean?'");

        let other = store.document(session_id, other_id).unwrap();
        assert_eq!(other.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_send_message_failure_appends_fallback() {
        let (mut store, session_id) = store_with_session();
        let doc = Document::new("a.png", "Lektion 1", "image/png", "");
        let doc_id = doc.id;
        store.add_document(session_id, doc).unwrap();

        let mut gateway = MockLessonGateway::new();
        gateway
            .expect_chat_turn()
            .returning(|_, _, _| Err(anyhow!("network down")));

        say(&mut store, &gateway, session_id, doc_id, "Hallo").await;

        let doc = store.document(session_id, doc_id).unwrap();
        assert_eq!(doc.messages.len(), 3);
        assert_eq!(doc.messages[2].text, CHAT_FALLBACK);
    }

    #[test]
    fn test_blank_message_is_ignored() {
        let (mut store, session_id) = store_with_session();
        let doc = Document::new("a.png", "Lektion 1", "image/png", "");
        let doc_id = doc.id;
        store.add_document(session_id, doc).unwrap();

        let pending = send_message(&mut store, session_id, doc_id, "   ").unwrap();
        assert!(pending.is_none());
        assert_eq!(store.document(session_id, doc_id).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_unknown_document_is_error() {
        let (mut store, session_id) = store_with_session();
        let missing = Uuid::new_v4();

        let err = send_message(&mut store, session_id, missing, "Hallo").unwrap_err();
        assert_eq!(err, StoreError::DocumentNotFound(missing));
    }

    #[tokio::test]
    async fn test_user_message_is_stored_before_the_reply_arrives() {
        let (mut store, session_id) = store_with_session();
        let doc = Document::new("a.png", "Lektion 1", "image/png", "QUJD");
        let doc_id = doc.id;
        store.add_document(session_id, doc).unwrap();

        let pending = send_message(&mut store, session_id, doc_id, "Hallo")
            .unwrap()
            .unwrap();
        let doc = store.document(session_id, doc_id).unwrap();
        assert_eq!(doc.messages.len(), 2);
        assert_eq!(doc.messages[1].role, MessageRole::User);

        // The store stays usable while the reply is outstanding.
        store.rename_session(session_id, "Unterwegs").unwrap();

        let mut gateway = MockLessonGateway::new();
        gateway
            .expect_chat_turn()
            .returning(|_, _, _| Ok("Hallo zurück!".to_string()));
        let reply = pending.resolve(&gateway).await;
        assert_eq!(reply.document_id, doc_id);
        apply_reply(&mut store, reply).unwrap();

        let doc = store.document(session_id, doc_id).unwrap();
        assert_eq!(doc.messages[2].text, "Hallo zurück!");
    }
}
