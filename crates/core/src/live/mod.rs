//! Live Spoken Conversation
//!
//! This module contains the client side of a live audio session with the
//! remote model. It is split into:
//!
//! - `bridge`: the session state machine, the single owner of every resource.
//! - `capture`: slices microphone samples into encoded PCM frames.
//! - `playback`: schedules inbound speech segments back to back.
//! - `grounding`: builds the instruction and re-anchor context.
//!
//! Devices and the network are reached only through the traits below, so the
//! state machine is exercised in tests without a microphone or a socket.

pub mod bridge;
pub mod capture;
pub mod grounding;
pub mod playback;

pub use bridge::LiveBridge;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Quiet period before a finished reply flips the status back to listening.
pub const SPEAKING_DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum LiveError {
    #[error("No document is selected")]
    NoDocumentSelected,
    #[error("Microphone access denied: {0}")]
    MicrophoneAccessDenied(String),
    #[error("Audio device error: {0}")]
    AudioDevice(String),
    #[error("Remote session error: {0}")]
    RemoteSession(String),
    #[error("Another live session is already active")]
    SessionAlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    Idle,
    Connecting,
    Active,
    Speaking,
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LiveStatus::Idle => "idle",
            LiveStatus::Connecting => "connecting",
            LiveStatus::Active => "active",
            LiveStatus::Speaking => "speaking",
        };
        f.write_str(label)
    }
}

/// Identifies one scheduled playback segment.
pub type SegmentId = u64;

/// A base64 media chunk as carried on the live wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

/// Everything the transport needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    /// Persona plus the serialized grounding history.
    pub instruction: String,
    /// The page image the conversation is about.
    pub document: MediaBlob,
}

/// A frame sent to the remote session.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Media(MediaBlob),
    Text(String),
}

/// Commands and callbacks, all funneled through `LiveBridge::handle`.
#[derive(Debug)]
pub enum LiveEvent {
    /// Open a session about the given document, if one is selected.
    Start(Option<Box<crate::models::Document>>),
    Stop,
    /// A signal produced on behalf of the session numbered `epoch`.
    Session { epoch: u64, signal: SessionSignal },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// The remote session finished its handshake.
    Opened,
    /// Base64 PCM16 speech at the playback rate.
    Audio(String),
    /// The user started talking over the model.
    Interrupted,
    Error(String),
    Closed,
    /// Microphone samples at the capture rate.
    Captured(Vec<f32>),
    /// A playback segment finished on its own.
    SegmentEnded(SegmentId),
    /// The speaking debounce elapsed.
    SpeakingSettled,
}

/// Lets devices and transports report back to the bridge that created them.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<LiveEvent>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<LiveEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Delivers a signal; returns false once the bridge is gone.
    pub fn emit(&self, signal: SessionSignal) -> bool {
        self.tx
            .send(LiveEvent::Session {
                epoch: self.epoch,
                signal,
            })
            .is_ok()
    }
}

/// Grants the microphone to at most one bridge at a time.
#[derive(Debug, Clone, Default)]
pub struct LiveSlot {
    taken: Arc<AtomicBool>,
}

impl LiveSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<LiveLease> {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LiveLease {
                taken: self.taken.clone(),
            })
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of one live session; releases the slot on drop.
#[derive(Debug)]
pub struct LiveLease {
    taken: Arc<AtomicBool>,
}

impl Drop for LiveLease {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Microphone stream plus its capture context.
pub trait AudioInput {
    /// Starts forwarding `Captured` signals.
    fn resume(&mut self) -> Result<(), LiveError>;
    /// Stops every track and releases the device. Must be idempotent.
    fn stop(&mut self);
}

/// Output device context with its own clock.
pub trait AudioOutput {
    /// Device time in seconds.
    fn current_time(&self) -> f64;
    /// Plays `samples` (mono, playback rate) starting at device time `at`.
    fn start_segment(&mut self, id: SegmentId, samples: Vec<f32>, at: f64);
    /// Stops a segment immediately, without a `SegmentEnded` signal.
    fn stop_segment(&mut self, id: SegmentId);
    /// Releases the device. Must be idempotent.
    fn close(&mut self);
}

pub trait LiveDevices {
    fn open_microphone(&mut self, sink: EventSink) -> Result<Box<dyn AudioInput>, LiveError>;
    fn open_output(&mut self, sink: EventSink) -> Result<Box<dyn AudioOutput>, LiveError>;
}

/// Handle to an open (or opening) remote session.
pub trait LiveLink {
    /// Queues a frame; delivery is not awaited.
    fn send(&mut self, frame: OutboundFrame);
    /// Closes the session in any state, including mid-handshake.
    fn close(&mut self);
}

pub trait LiveTransport {
    /// Starts opening a session and returns immediately; `Opened`, `Audio`,
    /// `Interrupted`, `Error` and `Closed` arrive later through `sink`.
    fn connect(&mut self, setup: LiveSetup, sink: EventSink)
    -> Result<Box<dyn LiveLink>, LiveError>;
}
