//! Terminal front end: owns the conversation store, the selection state and
//! the live bridge, and renders everything as plain lines.
//!
//! Gateway calls run on their own tasks and come back through the reply
//! channel, so the live session keeps being serviced while Mari thinks.

use crate::commands::{self, Command, HELP};
use anyhow::Result;
use mari_core::gateway::LessonGateway;
use mari_core::lesson::{self, LessonReply, PendingReply};
use mari_core::live::{LiveBridge, LiveError, LiveEvent, LiveStatus};
use mari_core::models::{Document, MessageRole, Session};
use mari_core::store::ConversationStore;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub const NO_DOCUMENT_HINT: &str = "Bitte laden Sie zuerst ein Dokument hoch.";
pub const MICROPHONE_HINT: &str = "Mikrofonzugriff erforderlich.";
pub const BUSY_HINT: &str = "Mari antwortet noch, einen Moment bitte.";

pub fn status_label(status: LiveStatus) -> &'static str {
    match status {
        LiveStatus::Idle => "Bereit",
        LiveStatus::Connecting => "Verbindet...",
        LiveStatus::Active => "Mari hört zu...",
        LiveStatus::Speaking => "Mari spricht...",
    }
}

pub struct App<W: Write> {
    store: ConversationStore,
    gateway: Arc<dyn LessonGateway>,
    live: Option<LiveBridge>,
    /// Index into the active session's documents.
    selected: usize,
    shown_status: LiveStatus,
    replies: mpsc::UnboundedSender<LessonReply>,
    /// Documents with a gateway call in flight.
    awaiting: HashSet<Uuid>,
    out: W,
}

impl<W: Write> App<W> {
    /// `live` is `None` when no live transport is configured. Replies from
    /// the gateway arrive on the returned receiver and go to [`App::on_reply`].
    pub fn new(
        mut store: ConversationStore,
        gateway: Arc<dyn LessonGateway>,
        live: Option<LiveBridge>,
        out: W,
    ) -> (Self, mpsc::UnboundedReceiver<LessonReply>) {
        if store.active_session().is_none() {
            match store.sessions().first().map(|s| s.id) {
                Some(id) => {
                    if let Err(e) = store.select_session(id) {
                        warn!(%id, error = %e, "Could not restore a session; starting a new one");
                        store.create_session();
                    }
                }
                None => {
                    store.create_session();
                }
            }
        }
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let app = Self {
            store,
            gateway,
            live,
            selected: 0,
            shown_status: LiveStatus::Idle,
            replies,
            awaiting: HashSet::new(),
            out,
        };
        (app, replies_rx)
    }

    #[cfg(test)]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    #[cfg(test)]
    pub fn out(&self) -> &W {
        &self.out
    }

    pub fn is_waiting(&self) -> bool {
        !self.awaiting.is_empty()
    }

    fn session(&self) -> Option<&Session> {
        self.store.active_session()
    }

    fn document(&self) -> Option<&Document> {
        self.session()?.documents.get(self.selected)
    }

    /// Runs one command. Returns `false` when the client should exit.
    pub async fn execute(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Empty => {}
            Command::Help => writeln!(self.out, "{}", HELP)?,
            Command::Invalid(usage) => writeln!(self.out, "Verwendung: {}", usage)?,
            Command::New => {
                self.store.create_session();
                self.selected = 0;
                writeln!(self.out, "Neue Sitzung erstellt.")?;
            }
            Command::Sessions => self.list_sessions()?,
            Command::Select(n) => {
                let id = n.checked_sub(1).and_then(|i| self.store.sessions().get(i)).map(|s| s.id);
                match id {
                    Some(id) => {
                        self.store.select_session(id)?;
                        self.selected = 0;
                        let title = self.session().map(|s| s.title.clone()).unwrap_or_default();
                        writeln!(self.out, "Sitzung gewählt: {}", title)?;
                    }
                    None => writeln!(self.out, "Keine Sitzung mit Nummer {}.", n)?,
                }
            }
            Command::Rename(title) => {
                if let Some(id) = self.store.active_session_id() {
                    self.store.rename_session(id, &title)?;
                    writeln!(self.out, "Sitzung umbenannt: {}", title)?;
                }
            }
            Command::Upload(path) => self.upload(&path).await?,
            Command::Docs => self.list_documents()?,
            Command::Doc(n) => {
                let count = self.session().map(|s| s.documents.len()).unwrap_or(0);
                if n == 0 || n > count {
                    writeln!(self.out, "Keine Lektion mit Nummer {}.", n)?;
                } else {
                    self.selected = n - 1;
                    let name = self.document().map(|d| d.display_name.clone()).unwrap_or_default();
                    writeln!(self.out, "{} gewählt.", name)?;
                }
            }
            Command::Say(text) => self.say(&text)?,
            Command::History => self.history()?,
            Command::Live => self.toggle_live()?,
            Command::Status => self.status()?,
            Command::Devices => self.devices()?,
            Command::Quit => {
                if self.is_waiting() {
                    warn!(pending = self.awaiting.len(), "Quitting with replies outstanding");
                }
                if let Some(bridge) = self.live.as_mut() {
                    bridge.handle(LiveEvent::Stop)?;
                }
                self.show_status()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stores a gateway reply and prints it.
    pub fn on_reply(&mut self, reply: LessonReply) -> Result<()> {
        self.awaiting.remove(&reply.document_id);
        let (session_id, document_id) = (reply.session_id, reply.document_id);
        let text = reply.message.text.clone();
        lesson::apply_reply(&mut self.store, reply)?;

        let shown = self.document().map(|d| d.id) == Some(document_id);
        if shown {
            writeln!(self.out, "Mari: {}", text)?;
        } else {
            let name = self
                .store
                .document(session_id, document_id)
                .map(|d| d.display_name.clone())
                .unwrap_or_default();
            writeln!(self.out, "Mari ({}): {}", name, text)?;
        }
        Ok(())
    }

    /// Runs the gateway call on its own task.
    fn dispatch(&mut self, pending: PendingReply) {
        self.awaiting.insert(pending.document_id());
        let gateway = Arc::clone(&self.gateway);
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let reply = pending.resolve(gateway.as_ref()).await;
            if replies.send(reply).is_err() {
                warn!("Reply arrived after the client shut down");
            }
        });
    }

    /// Feeds a bridge callback through and reports any status change.
    pub fn on_live_event(&mut self, event: LiveEvent) -> Result<()> {
        if let Some(bridge) = self.live.as_mut() {
            if let Err(e) = bridge.handle(event) {
                self.report_live_error(&e)?;
            }
        }
        self.show_status()
    }

    fn list_sessions(&mut self) -> Result<()> {
        let active = self.store.active_session_id();
        for (i, session) in self.store.sessions().iter().enumerate() {
            let marker = if Some(session.id) == active { '*' } else { ' ' };
            writeln!(
                self.out,
                "{} {}. {} ({} Lektionen, zuletzt {})",
                marker,
                i + 1,
                session.title,
                session.documents.len(),
                session.last_active.format("%d.%m.%Y %H:%M")
            )?;
        }
        Ok(())
    }

    fn list_documents(&mut self) -> Result<()> {
        let Some(session) = self.store.active_session() else {
            return Ok(());
        };
        if session.documents.is_empty() {
            writeln!(self.out, "{}", NO_DOCUMENT_HINT)?;
            return Ok(());
        }
        for (i, doc) in session.documents.iter().enumerate() {
            let marker = if i == self.selected { '*' } else { ' ' };
            writeln!(self.out, "{} {}. {} ({})", marker, i + 1, doc.display_name, doc.name)?;
        }
        Ok(())
    }

    async fn upload(&mut self, path: &std::path::Path) -> Result<()> {
        let Some(media_type) = commands::media_type_for(path) else {
            writeln!(self.out, "Nur Bilder werden unterstützt (jpg, png, webp, gif, heic).")?;
            return Ok(());
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read upload");
                writeln!(self.out, "Datei konnte nicht gelesen werden: {}", e)?;
                return Ok(());
            }
        };
        let Some(session_id) = self.store.active_session_id() else {
            return Ok(());
        };
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("dokument");

        writeln!(self.out, "Mari: Hallo! Ich scanne \"{}\" jetzt ganz genau für dich ein...", filename)?;
        let (pending, index) =
            lesson::upload_document(&mut self.store, session_id, filename, media_type, &bytes)?;
        self.selected = index;
        info!(index, "Document uploaded");
        self.dispatch(pending);
        Ok(())
    }

    fn say(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let (Some(session_id), Some(document_id)) = (
            self.store.active_session_id(),
            self.document().map(|d| d.id),
        ) else {
            writeln!(self.out, "{}", NO_DOCUMENT_HINT)?;
            return Ok(());
        };
        // One outstanding reply per thread keeps user and model turns paired.
        if self.awaiting.contains(&document_id) {
            writeln!(self.out, "{}", BUSY_HINT)?;
            return Ok(());
        }
        if let Some(pending) =
            lesson::send_message(&mut self.store, session_id, document_id, text)?
        {
            self.dispatch(pending);
        }
        Ok(())
    }

    fn history(&mut self) -> Result<()> {
        let Some(document) = self.document() else {
            writeln!(self.out, "{}", NO_DOCUMENT_HINT)?;
            return Ok(());
        };
        let lines: Vec<String> = document
            .messages
            .iter()
            .map(|m| match m.role {
                MessageRole::User => format!("Du: {}", m.text),
                MessageRole::Model => format!("Mari: {}", m.text),
            })
            .collect();
        for line in lines {
            writeln!(self.out, "{}", line)?;
        }
        Ok(())
    }

    fn toggle_live(&mut self) -> Result<()> {
        let document = self.document().cloned().map(Box::new);
        let Some(bridge) = self.live.as_mut() else {
            writeln!(self.out, "Sprachmodus ist nicht verfügbar (GEMINI_API_KEY fehlt).")?;
            return Ok(());
        };
        let event = if bridge.status() == LiveStatus::Idle {
            LiveEvent::Start(document)
        } else {
            LiveEvent::Stop
        };
        if let Err(e) = bridge.handle(event) {
            self.report_live_error(&e)?;
        }
        self.show_status()
    }

    fn report_live_error(&mut self, error: &LiveError) -> Result<()> {
        match error {
            LiveError::NoDocumentSelected => writeln!(self.out, "{}", NO_DOCUMENT_HINT)?,
            LiveError::MicrophoneAccessDenied(_) => writeln!(self.out, "{}", MICROPHONE_HINT)?,
            other => writeln!(self.out, "Sprachmodus fehlgeschlagen: {}", other)?,
        }
        Ok(())
    }

    /// Prints the live status label if it changed since last shown.
    fn show_status(&mut self) -> Result<()> {
        let status = self
            .live
            .as_ref()
            .map(|b| b.status())
            .unwrap_or(LiveStatus::Idle);
        if status != self.shown_status {
            self.shown_status = status;
            writeln!(self.out, "[{}]", status_label(status))?;
        }
        Ok(())
    }

    fn status(&mut self) -> Result<()> {
        let session = self.session().map(|s| s.title.clone()).unwrap_or_default();
        let document = self
            .document()
            .map(|d| d.display_name.clone())
            .unwrap_or_else(|| "keine Lektion".to_string());
        let live = self
            .live
            .as_ref()
            .map(|b| status_label(b.status()))
            .unwrap_or("nicht verfügbar");
        write!(self.out, "Sitzung: {} | {} | Sprachmodus: {}", session, document, live)?;
        if let Some(playback) = self.live.as_ref().and_then(|b| b.playback()) {
            write!(self.out, " | Mari hat {:.1} s gesprochen", playback.spoken_secs())?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    fn devices(&mut self) -> Result<()> {
        let (inputs, outputs) = mari_native_utils::list_devices()?;
        writeln!(self.out, "Eingabe: {}", inputs.join(", "))?;
        writeln!(self.out, "Ausgabe: {}", outputs.join(", "))?;
        Ok(())
    }
}
