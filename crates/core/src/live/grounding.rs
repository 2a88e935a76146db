//! Grounding context for the live conversation.
//!
//! The remote model treats the document's chat history as the authoritative
//! record of what the page says, so the whole thread is folded into the
//! session instruction.

use super::{LiveSetup, MediaBlob, OutboundFrame};
use crate::models::{Document, Message};
use crate::prompts::PromptSet;

const HISTORY_HEADER: &str = "\n\n### DEINE MASTER-DATENBANK (CHAT-HISTORIE):\n";

/// Sent with the re-shown page once the session is open.
pub const REANCHOR_NOTE: &str = "Ich habe dir das Dokument erneut gezeigt. Beziehe dich bei Fragen auf unsere bisherige Chat-Analyse.";

/// One `ROLE: text` line per message, in thread order.
pub fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.to_string().to_uppercase(), m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Persona followed by the live rules with the history spliced in.
pub fn live_instruction(prompts: &PromptSet, messages: &[Message]) -> String {
    let history = if messages.is_empty() {
        String::new()
    } else {
        format!("{}{}", HISTORY_HEADER, serialize_history(messages))
    };
    let live = prompts.live.replace("{history}", &history);
    format!("{}\n\n{}", prompts.system.trim_end(), live.trim_end())
}

pub fn document_blob(document: &Document) -> MediaBlob {
    MediaBlob {
        mime_type: document.media_type.clone(),
        data: document.data.clone(),
    }
}

pub fn live_setup(prompts: &PromptSet, document: &Document) -> LiveSetup {
    LiveSetup {
        instruction: live_instruction(prompts, &document.messages),
        document: document_blob(document),
    }
}

/// Frames sent right after the session opens: the page again plus a short
/// note. Empty when the document carries no image.
pub fn reanchor_frames(document: &MediaBlob) -> Vec<OutboundFrame> {
    if document.data.is_empty() {
        return Vec::new();
    }
    vec![
        OutboundFrame::Media(document.clone()),
        OutboundFrame::Text(REANCHOR_NOTE.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts() -> PromptSet {
        PromptSet {
            system: "PERSONA\n".to_string(),
            live: "REGELN{history}\n".to_string(),
            analyze: "ANALYSE".to_string(),
        }
    }

    #[test]
    fn test_serialize_history_role_tagged_lines() {
        let messages = vec![Message::model("Hallo!"), Message::user("Was ist das?")];
        assert_eq!(
            serialize_history(&messages),
            "MODEL: Hallo!\nUSER: Was ist das?"
        );
    }

    #[test]
    fn test_live_instruction_with_history() {
        let messages = vec![Message::model("Text A gehört zu Bild 1.")];
        assert_eq!(
            live_instruction(&prompts(), &messages),
            "PERSONA\n\nREGELN\n\n### DEINE MASTER-DATENBANK (CHAT-HISTORIE):\nMODEL: Text A gehört zu Bild 1."
        );
    }

    #[test]
    fn test_live_instruction_without_history() {
        assert_eq!(live_instruction(&prompts(), &[]), "PERSONA\n\nREGELN");
    }

    #[test]
    fn test_live_setup_carries_document_image() {
        let doc = Document::new("a.jpg", "Lektion 1", "image/jpeg", "QUJD");
        let setup = live_setup(&prompts(), &doc);
        assert_eq!(setup.document.mime_type, "image/jpeg");
        assert_eq!(setup.document.data, "QUJD");
        assert!(setup.instruction.contains("MODEL: Hallo!"));
    }

    #[test]
    fn test_reanchor_frames() {
        let blob = MediaBlob {
            mime_type: "image/png".to_string(),
            data: "QUJD".to_string(),
        };
        let frames = reanchor_frames(&blob);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], OutboundFrame::Media(blob.clone()));
        assert_eq!(frames[1], OutboundFrame::Text(REANCHOR_NOTE.to_string()));

        let empty = MediaBlob {
            data: String::new(),
            ..blob
        };
        assert!(reanchor_frames(&empty).is_empty());
    }
}
