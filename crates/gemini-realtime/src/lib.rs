//! Gemini Live transport for the live session bridge.
//!
//! Each `connect` spawns one task that owns the WebSocket. It performs the
//! setup handshake, shows the model the document page, reports `Opened` and
//! then proxies frames in both directions until either side closes.

pub mod types;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mari_core::live::{
    EventSink, LiveError, LiveLink, LiveSetup, LiveTransport, MediaBlob, OutboundFrame,
    SessionSignal,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use types::{
    ClientContent, ClientMessage, Content, GenerationConfig, Part, PrebuiltVoiceConfig,
    ResponseModality, ServerMessage, Setup, SpeechConfig, VoiceConfig,
};

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    model: String,
    voice: String,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", LIVE_ENDPOINT, self.api_key)
    }

    /// The opening `setup` message for a session with `instruction`.
    pub fn setup_message(&self, instruction: &str) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(instruction)],
            },
        })
    }
}

impl LiveTransport for GeminiLiveTransport {
    fn connect(
        &mut self,
        setup: LiveSetup,
        sink: EventSink,
    ) -> Result<Box<dyn LiveLink>, LiveError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LiveError::RemoteSession(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let url = self.url();
        let setup_msg = self.setup_message(&setup.instruction);
        let document = setup.document;

        let task = runtime.spawn(async move {
            match run(url, setup_msg, document, rx, &sink).await {
                Ok(()) => {
                    sink.emit(SessionSignal::Closed);
                }
                Err(e) => {
                    error!(epoch = sink.epoch(), error = ?e, "Gemini live session failed");
                    sink.emit(SessionSignal::Error(format!("{e:#}")));
                }
            }
        });

        Ok(Box::new(GeminiLiveLink { tx, task }))
    }
}

/// Handle held by the bridge for one session task.
pub struct GeminiLiveLink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    task: JoinHandle<()>,
}

impl LiveLink for GeminiLiveLink {
    fn send(&mut self, frame: OutboundFrame) {
        if self.tx.send(frame).is_err() {
            debug!("Live session task already finished; dropping frame");
        }
    }

    fn close(&mut self) {
        self.task.abort();
    }
}

impl Drop for GeminiLiveLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn encode(msg: &ClientMessage) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(msg)?.into()))
}

/// Runs one session until the server closes it, the link goes away or an
/// error occurs.
async fn run(
    url: String,
    setup: ClientMessage,
    document: MediaBlob,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    sink: &EventSink,
) -> Result<()> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("connecting to Gemini Live")?;
    info!(epoch = sink.epoch(), "Connected to Gemini Live WebSocket.");
    let (mut gemini_tx, mut gemini_rx) = ws_stream.split();

    gemini_tx.send(encode(&setup)?).await?;

    let mut is_ready = false;
    let mut pending: Vec<OutboundFrame> = Vec::new();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    let _ = gemini_tx.send(WsMessage::Close(None)).await;
                    return Ok(());
                };
                if !is_ready {
                    pending.push(frame);
                    continue;
                }
                gemini_tx.send(encode(&ClientMessage::from(frame))?).await?;
            },
            msg = gemini_rx.next() => {
                let payload = match msg {
                    Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(WsMessage::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Gemini Live closed the session.");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("reading from Gemini Live"),
                    None => return Ok(()),
                };
                let message: ServerMessage = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unparseable Gemini Live message");
                        continue;
                    }
                };

                if !is_ready {
                    if message.setup_complete.is_none() {
                        warn!(?message, "Unexpected message before setup completed");
                        continue;
                    }
                    info!("Gemini session setup is complete. Ready for bidirectional streaming.");
                    is_ready = true;
                    if !document.data.is_empty() {
                        let turn = ClientMessage::ClientContent(ClientContent {
                            turns: vec![Content {
                                role: Some("user".to_string()),
                                parts: vec![Part::inline(document.clone())],
                            }],
                            turn_complete: false,
                        });
                        gemini_tx.send(encode(&turn)?).await?;
                    }
                    for frame in pending.drain(..) {
                        gemini_tx.send(encode(&ClientMessage::from(frame))?).await?;
                    }
                    if !sink.emit(SessionSignal::Opened) {
                        return Ok(());
                    }
                    continue;
                }

                if message.go_away.is_some() {
                    warn!("Gemini Live announced it is going away");
                }
                for signal in message.signals() {
                    if !sink.emit(signal) {
                        return Ok(());
                    }
                }
            },
        }
    }
}
