//! Live Session Bridge
//!
//! Owns one live session at a time: microphone, output device, remote link and
//! the speaking debounce. Commands and every device or network callback enter
//! through `handle`, one at a time, so no locking is needed. Every exit path
//! (stop, remote error, remote close, drop) goes through `teardown`.

use super::capture::CaptureEncoder;
use super::grounding;
use super::playback::PlaybackScheduler;
use super::{
    AudioInput, EventSink, LiveDevices, LiveError, LiveEvent, LiveLease, LiveLink, LiveSlot,
    LiveStatus, LiveTransport, MediaBlob, OutboundFrame, SPEAKING_DEBOUNCE, SessionSignal,
};
use crate::audio::decode_f32_from_base64_i16;
use crate::models::Document;
use crate::prompts::PromptSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resources acquired between `connecting` and teardown.
struct ActiveSession {
    _lease: LiveLease,
    input: Box<dyn AudioInput>,
    playback: PlaybackScheduler,
    link: Box<dyn LiveLink>,
    anchor: MediaBlob,
    settle: Option<JoinHandle<()>>,
}

pub struct LiveBridge {
    devices: Box<dyn LiveDevices>,
    transport: Box<dyn LiveTransport>,
    prompts: PromptSet,
    slot: LiveSlot,
    events_tx: mpsc::UnboundedSender<LiveEvent>,
    status: LiveStatus,
    epoch: u64,
    encoder: CaptureEncoder,
    session: Option<ActiveSession>,
}

impl LiveBridge {
    /// Creates an idle bridge and the receiver its callbacks report to. The
    /// owner feeds everything from the receiver back into `handle`.
    pub fn new(
        devices: Box<dyn LiveDevices>,
        transport: Box<dyn LiveTransport>,
        prompts: PromptSet,
        slot: LiveSlot,
    ) -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            devices,
            transport,
            prompts,
            slot,
            events_tx,
            status: LiveStatus::Idle,
            epoch: 0,
            encoder: CaptureEncoder::default(),
            session: None,
        };
        (bridge, events_rx)
    }

    pub fn status(&self) -> LiveStatus {
        self.status
    }

    /// Number of the current (or last) session.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<LiveEvent> {
        self.events_tx.clone()
    }

    pub fn playback(&self) -> Option<&PlaybackScheduler> {
        self.session.as_ref().map(|s| &s.playback)
    }

    /// Single entry point for commands and callbacks.
    ///
    /// Only `Start` can fail; remote failures end the session and show up as
    /// a status change.
    pub fn handle(&mut self, event: LiveEvent) -> Result<(), LiveError> {
        match event {
            LiveEvent::Start(document) => self.start(document.as_deref()),
            LiveEvent::Stop => {
                self.teardown("stopped");
                Ok(())
            }
            LiveEvent::Session { epoch, signal } => {
                if epoch != self.epoch || self.session.is_none() {
                    debug!(epoch, current = self.epoch, "Dropping signal from a closed session");
                    return Ok(());
                }
                self.on_signal(signal);
                Ok(())
            }
        }
    }

    fn start(&mut self, document: Option<&Document>) -> Result<(), LiveError> {
        let document = document.ok_or(LiveError::NoDocumentSelected)?;
        if self.session.is_some() {
            info!("Live session already running; stopping it before starting a new one");
            self.teardown("restarted");
        }

        let lease = self
            .slot
            .try_acquire()
            .ok_or(LiveError::SessionAlreadyActive)?;
        self.epoch += 1;
        self.status = LiveStatus::Connecting;
        info!(epoch = self.epoch, document = %document.display_name, "Starting live session");
        let sink = EventSink::new(self.epoch, self.events_tx.clone());

        let mut input = match self.devices.open_microphone(sink.clone()) {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "Could not open microphone");
                self.status = LiveStatus::Idle;
                return Err(e);
            }
        };
        let mut output = match self.devices.open_output(sink.clone()) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Could not open output device");
                input.stop();
                self.status = LiveStatus::Idle;
                return Err(e);
            }
        };

        let setup = grounding::live_setup(&self.prompts, document);
        let anchor = setup.document.clone();
        let link = match self.transport.connect(setup, sink) {
            Ok(link) => link,
            Err(e) => {
                error!(error = %e, "Could not open remote session");
                input.stop();
                output.close();
                self.status = LiveStatus::Idle;
                return Err(e);
            }
        };

        self.encoder.reset();
        self.session = Some(ActiveSession {
            _lease: lease,
            input,
            playback: PlaybackScheduler::new(output),
            link,
            anchor,
            settle: None,
        });
        Ok(())
    }

    fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Error(message) => {
                error!(%message, "Remote session error");
                self.teardown("remote error");
                return;
            }
            SessionSignal::Closed => {
                info!("Remote session closed");
                self.teardown("remote closed");
                return;
            }
            _ => {}
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let streaming = matches!(self.status, LiveStatus::Active | LiveStatus::Speaking);

        match signal {
            SessionSignal::Opened => {
                if self.status != LiveStatus::Connecting {
                    return;
                }
                if let Err(e) = session.input.resume() {
                    error!(error = %e, "Microphone capture failed to start");
                    self.teardown("capture failed");
                    return;
                }
                for frame in grounding::reanchor_frames(&session.anchor) {
                    session.link.send(frame);
                }
                self.status = LiveStatus::Active;
                info!("Live session open; listening");
            }
            SessionSignal::Captured(samples) => {
                if !streaming {
                    return;
                }
                for blob in self.encoder.push(&samples) {
                    session.link.send(OutboundFrame::Media(blob));
                }
            }
            SessionSignal::Audio(data) => {
                if !streaming {
                    return;
                }
                let samples = decode_f32_from_base64_i16(&data);
                if samples.is_empty() {
                    warn!("Ignoring empty audio frame");
                    return;
                }
                cancel_settle(session);
                session.playback.schedule(samples);
                self.status = LiveStatus::Speaking;
            }
            SessionSignal::Interrupted => {
                if !streaming {
                    return;
                }
                cancel_settle(session);
                session.playback.interrupt();
                self.status = LiveStatus::Active;
                debug!("Playback interrupted by user speech");
            }
            SessionSignal::SegmentEnded(id) => {
                if session.playback.finish(id) && self.status == LiveStatus::Speaking {
                    cancel_settle(session);
                    session.settle = Some(spawn_settle(self.events_tx.clone(), self.epoch));
                }
            }
            SessionSignal::SpeakingSettled => {
                // A cancelled debounce may still have queued its signal.
                if session.settle.take().is_none() || session.playback.playing_count() > 0 {
                    return;
                }
                if self.status == LiveStatus::Speaking {
                    self.status = LiveStatus::Active;
                }
            }
            SessionSignal::Error(_) | SessionSignal::Closed => {}
        }
    }

    /// Releases everything the session acquired. Safe in any state and when
    /// called repeatedly.
    fn teardown(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            cancel_settle(&mut session);
            session.link.close();
            session.input.stop();
            session.playback.close();
            info!(epoch = self.epoch, reason, "Live session torn down");
        }
        self.encoder.reset();
        self.status = LiveStatus::Idle;
    }
}

impl Drop for LiveBridge {
    fn drop(&mut self) {
        self.teardown("bridge dropped");
    }
}

fn cancel_settle(session: &mut ActiveSession) {
    if let Some(handle) = session.settle.take() {
        handle.abort();
    }
}

fn spawn_settle(tx: mpsc::UnboundedSender<LiveEvent>, epoch: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(SPEAKING_DEBOUNCE).await;
        let _ = tx.send(LiveEvent::Session {
            epoch,
            signal: SessionSignal::SpeakingSettled,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CAPTURE_MIME_TYPE, encode_f32_to_base64_i16};
    use crate::live::capture::CAPTURE_FRAME_SAMPLES;
    use crate::live::playback::tests::{FakeOutput, OutputLog};
    use crate::live::{AudioOutput, LiveSetup};
    use crate::models::Message;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    /// Everything the fake platform was asked to do.
    #[derive(Default)]
    struct Ledger {
        deny_microphone: bool,
        mics_opened: usize,
        mics_resumed: usize,
        mics_stopped: usize,
        outputs_opened: usize,
        links_opened: usize,
        links_closed: usize,
        setups: Vec<LiveSetup>,
        sent: Vec<OutboundFrame>,
        output: Rc<RefCell<OutputLog>>,
    }

    type Shared = Rc<RefCell<Ledger>>;

    struct FakeInput {
        ledger: Shared,
        stopped: bool,
    }

    impl AudioInput for FakeInput {
        fn resume(&mut self) -> Result<(), LiveError> {
            self.ledger.borrow_mut().mics_resumed += 1;
            Ok(())
        }
        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.ledger.borrow_mut().mics_stopped += 1;
            }
        }
    }

    struct FakeDevices(Shared);

    impl LiveDevices for FakeDevices {
        fn open_microphone(&mut self, _sink: EventSink) -> Result<Box<dyn AudioInput>, LiveError> {
            let mut ledger = self.0.borrow_mut();
            if ledger.deny_microphone {
                return Err(LiveError::MicrophoneAccessDenied("denied".to_string()));
            }
            ledger.mics_opened += 1;
            Ok(Box::new(FakeInput {
                ledger: self.0.clone(),
                stopped: false,
            }))
        }
        fn open_output(&mut self, _sink: EventSink) -> Result<Box<dyn AudioOutput>, LiveError> {
            let mut ledger = self.0.borrow_mut();
            ledger.outputs_opened += 1;
            Ok(Box::new(FakeOutput(ledger.output.clone())))
        }
    }

    struct FakeLink(Shared);

    impl LiveLink for FakeLink {
        fn send(&mut self, frame: OutboundFrame) {
            self.0.borrow_mut().sent.push(frame);
        }
        fn close(&mut self) {
            self.0.borrow_mut().links_closed += 1;
        }
    }

    struct FakeTransport(Shared);

    impl LiveTransport for FakeTransport {
        fn connect(
            &mut self,
            setup: LiveSetup,
            _sink: EventSink,
        ) -> Result<Box<dyn LiveLink>, LiveError> {
            let mut ledger = self.0.borrow_mut();
            ledger.links_opened += 1;
            ledger.setups.push(setup);
            Ok(Box::new(FakeLink(self.0.clone())))
        }
    }

    fn prompts() -> PromptSet {
        PromptSet {
            system: "PERSONA".to_string(),
            live: "REGELN{history}".to_string(),
            analyze: "ANALYSE".to_string(),
        }
    }

    fn bridge_with(
        slot: LiveSlot,
    ) -> (LiveBridge, mpsc::UnboundedReceiver<LiveEvent>, Shared) {
        let ledger: Shared = Rc::new(RefCell::new(Ledger::default()));
        let (bridge, rx) = LiveBridge::new(
            Box::new(FakeDevices(ledger.clone())),
            Box::new(FakeTransport(ledger.clone())),
            prompts(),
            slot,
        );
        (bridge, rx, ledger)
    }

    fn bridge() -> (LiveBridge, mpsc::UnboundedReceiver<LiveEvent>, Shared) {
        bridge_with(LiveSlot::new())
    }

    fn lesson() -> Option<Box<Document>> {
        let mut doc = Document::new("seite.jpg", "Lektion 1", "image/jpeg", "QUJD");
        doc.messages.push(Message::user("Was bedeutet das?"));
        Some(Box::new(doc))
    }

    fn signal(bridge: &mut LiveBridge, signal: SessionSignal) {
        let epoch = bridge.epoch();
        bridge
            .handle(LiveEvent::Session { epoch, signal })
            .unwrap();
    }

    fn speech(secs: f64) -> String {
        encode_f32_to_base64_i16(&vec![0.1; (secs * 24000.0) as usize])
    }

    fn assert_released(ledger: &Shared) {
        let ledger = ledger.borrow();
        assert_eq!(ledger.mics_opened, ledger.mics_stopped, "leaked microphone");
        assert_eq!(ledger.outputs_opened, ledger.output.borrow().closed, "leaked output");
        assert_eq!(ledger.links_opened, ledger.links_closed, "leaked link");
    }

    fn open(bridge: &mut LiveBridge) {
        bridge.handle(LiveEvent::Start(lesson())).unwrap();
        signal(bridge, SessionSignal::Opened);
    }

    #[tokio::test]
    async fn test_start_without_document_never_connects() {
        let (mut bridge, _rx, ledger) = bridge();

        let err = bridge.handle(LiveEvent::Start(None)).unwrap_err();

        assert_eq!(err, LiveError::NoDocumentSelected);
        assert_eq!(bridge.status(), LiveStatus::Idle);
        assert_eq!(ledger.borrow().links_opened, 0);
        assert_eq!(ledger.borrow().mics_opened, 0);
    }

    #[tokio::test]
    async fn test_start_connects_with_grounded_setup() {
        let (mut bridge, _rx, ledger) = bridge();

        bridge.handle(LiveEvent::Start(lesson())).unwrap();

        assert_eq!(bridge.status(), LiveStatus::Connecting);
        let ledger = ledger.borrow();
        assert_eq!(ledger.setups.len(), 1);
        let setup = &ledger.setups[0];
        assert!(setup.instruction.starts_with("PERSONA\n\nREGELN"));
        assert!(setup.instruction.contains("USER: Was bedeutet das?"));
        assert_eq!(setup.document.mime_type, "image/jpeg");
        assert_eq!(setup.document.data, "QUJD");
        // Capture does not start before the session opens.
        assert_eq!(ledger.mics_resumed, 0);
    }

    #[tokio::test]
    async fn test_open_resumes_capture_and_reanchors() {
        let (mut bridge, _rx, ledger) = bridge();
        open(&mut bridge);

        assert_eq!(bridge.status(), LiveStatus::Active);
        let ledger = ledger.borrow();
        assert_eq!(ledger.mics_resumed, 1);
        assert_eq!(ledger.sent.len(), 2);
        assert!(matches!(&ledger.sent[0], OutboundFrame::Media(b) if b.mime_type == "image/jpeg"));
        assert_eq!(
            ledger.sent[1],
            OutboundFrame::Text(grounding::REANCHOR_NOTE.to_string())
        );
    }

    #[tokio::test]
    async fn test_captured_audio_forwarded_only_while_open() {
        let (mut bridge, _rx, ledger) = bridge();
        bridge.handle(LiveEvent::Start(lesson())).unwrap();
        signal(&mut bridge, SessionSignal::Captured(vec![0.0; CAPTURE_FRAME_SAMPLES]));
        assert!(ledger.borrow().sent.is_empty());

        signal(&mut bridge, SessionSignal::Opened);
        signal(&mut bridge, SessionSignal::Captured(vec![0.2; CAPTURE_FRAME_SAMPLES + 10]));

        let ledger = ledger.borrow();
        let audio: Vec<_> = ledger
            .sent
            .iter()
            .filter(|f| matches!(f, OutboundFrame::Media(b) if b.mime_type == CAPTURE_MIME_TYPE))
            .collect();
        assert_eq!(audio.len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_audio_schedules_back_to_back() {
        let (mut bridge, _rx, ledger) = bridge();
        open(&mut bridge);

        signal(&mut bridge, SessionSignal::Audio(speech(0.5)));
        signal(&mut bridge, SessionSignal::Audio(speech(0.25)));
        signal(&mut bridge, SessionSignal::Audio(speech(1.0)));

        assert_eq!(bridge.status(), LiveStatus::Speaking);
        let ledger = ledger.borrow();
        let output = ledger.output.borrow();
        let starts: Vec<f64> = output.started.iter().map(|(_, at, _)| *at).collect();
        assert_eq!(starts, vec![0.0, 0.5, 0.75]);
        assert_eq!(bridge.playback().unwrap().next_start(), 1.75);
    }

    #[tokio::test]
    async fn test_interruption_clears_playback() {
        let (mut bridge, _rx, ledger) = bridge();
        open(&mut bridge);
        for _ in 0..4 {
            signal(&mut bridge, SessionSignal::Audio(speech(0.5)));
        }

        signal(&mut bridge, SessionSignal::Interrupted);

        assert_eq!(bridge.status(), LiveStatus::Active);
        let playback = bridge.playback().unwrap();
        assert_eq!(playback.playing_count(), 0);
        assert_eq!(playback.next_start(), 0.0);
        assert_eq!(ledger.borrow().output.borrow().stopped.len(), 4);

        // The next reply starts on a fresh time basis.
        signal(&mut bridge, SessionSignal::Audio(speech(0.5)));
        let ledger = ledger.borrow();
        let output = ledger.output.borrow();
        assert_eq!(output.started.last().unwrap().1, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_settles_once_after_debounce() {
        let (mut bridge, mut rx, _ledger) = bridge();
        open(&mut bridge);
        signal(&mut bridge, SessionSignal::Audio(speech(0.1)));
        signal(&mut bridge, SessionSignal::Audio(speech(0.1)));

        signal(&mut bridge, SessionSignal::SegmentEnded(0));
        assert_eq!(bridge.status(), LiveStatus::Speaking);
        signal(&mut bridge, SessionSignal::SegmentEnded(1));
        assert_eq!(bridge.status(), LiveStatus::Speaking);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            LiveEvent::Session { signal: SessionSignal::SpeakingSettled, .. }
        ));
        bridge.handle(event).unwrap();
        assert_eq!(bridge.status(), LiveStatus::Active);

        // A duplicate settle is a no-op and nothing else was queued.
        signal(&mut bridge, SessionSignal::SpeakingSettled);
        assert_eq!(bridge.status(), LiveStatus::Active);
        tokio::time::sleep(SPEAKING_DEBOUNCE * 4).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_audio_cancels_pending_debounce() {
        let (mut bridge, mut rx, _ledger) = bridge();
        open(&mut bridge);
        signal(&mut bridge, SessionSignal::Audio(speech(0.1)));
        signal(&mut bridge, SessionSignal::SegmentEnded(0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        signal(&mut bridge, SessionSignal::Audio(speech(0.1)));
        tokio::time::sleep(SPEAKING_DEBOUNCE * 2).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.status(), LiveStatus::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_audio_keeps_pending_debounce() {
        let (mut bridge, mut rx, _ledger) = bridge();
        open(&mut bridge);
        signal(&mut bridge, SessionSignal::Audio(speech(0.1)));
        signal(&mut bridge, SessionSignal::SegmentEnded(0));
        signal(&mut bridge, SessionSignal::Audio(String::new()));
        assert_eq!(bridge.status(), LiveStatus::Speaking);

        let event = rx.recv().await.unwrap();
        bridge.handle(event).unwrap();
        assert_eq!(bridge.status(), LiveStatus::Active);
        assert_eq!(bridge.playback().unwrap().playing_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_from_every_state_releases_everything() {
        let states: [fn(&mut LiveBridge); 3] = [
            |b| {
                b.handle(LiveEvent::Start(lesson())).unwrap();
            },
            |b| open(b),
            |b| {
                open(b);
                signal(b, SessionSignal::Audio(speech(0.2)));
            },
        ];

        for reach in states {
            let (mut bridge, _rx, ledger) = bridge();
            reach(&mut bridge);
            assert_ne!(bridge.status(), LiveStatus::Idle);

            bridge.handle(LiveEvent::Stop).unwrap();
            bridge.handle(LiveEvent::Stop).unwrap();

            assert_eq!(bridge.status(), LiveStatus::Idle);
            assert!(bridge.playback().is_none());
            assert_released(&ledger);

            // Late frames from the closed session are ignored.
            let started = ledger.borrow().output.borrow().started.len();
            signal(&mut bridge, SessionSignal::Audio(speech(0.2)));
            signal(&mut bridge, SessionSignal::Opened);
            assert_eq!(bridge.status(), LiveStatus::Idle);
            assert_eq!(ledger.borrow().output.borrow().started.len(), started);
        }
    }

    #[tokio::test]
    async fn test_repeated_cycles_leak_nothing() {
        let slot = LiveSlot::new();
        let (mut bridge, _rx, ledger) = bridge_with(slot.clone());

        for _ in 0..10 {
            open(&mut bridge);
            signal(&mut bridge, SessionSignal::Audio(speech(0.1)));
            bridge.handle(LiveEvent::Stop).unwrap();
        }

        assert_released(&ledger);
        assert_eq!(ledger.borrow().mics_opened, 10);
        assert!(!slot.is_taken());
    }

    #[tokio::test]
    async fn test_remote_error_and_close_tear_down() {
        for ending in [SessionSignal::Error("boom".to_string()), SessionSignal::Closed] {
            let (mut bridge, _rx, ledger) = bridge();
            open(&mut bridge);
            signal(&mut bridge, SessionSignal::Audio(speech(0.2)));

            signal(&mut bridge, ending);

            assert_eq!(bridge.status(), LiveStatus::Idle);
            assert_released(&ledger);
        }
    }

    #[tokio::test]
    async fn test_microphone_denied_reverts_to_idle() {
        let slot = LiveSlot::new();
        let (mut bridge, _rx, ledger) = bridge_with(slot.clone());
        ledger.borrow_mut().deny_microphone = true;

        let err = bridge.handle(LiveEvent::Start(lesson())).unwrap_err();

        assert!(matches!(err, LiveError::MicrophoneAccessDenied(_)));
        assert_eq!(bridge.status(), LiveStatus::Idle);
        assert_eq!(ledger.borrow().links_opened, 0);
        assert!(!slot.is_taken());
    }

    #[tokio::test]
    async fn test_second_bridge_cannot_take_the_microphone() {
        let slot = LiveSlot::new();
        let (mut first, _rx1, _l1) = bridge_with(slot.clone());
        let (mut second, _rx2, l2) = bridge_with(slot.clone());

        first.handle(LiveEvent::Start(lesson())).unwrap();
        let err = second.handle(LiveEvent::Start(lesson())).unwrap_err();
        assert_eq!(err, LiveError::SessionAlreadyActive);
        assert_eq!(l2.borrow().mics_opened, 0);

        first.handle(LiveEvent::Stop).unwrap();
        second.handle(LiveEvent::Start(lesson())).unwrap();
        assert_eq!(second.status(), LiveStatus::Connecting);
    }

    #[tokio::test]
    async fn test_restart_stops_existing_session_first() {
        let (mut bridge, _rx, ledger) = bridge();
        open(&mut bridge);
        let old_epoch = bridge.epoch();

        bridge.handle(LiveEvent::Start(lesson())).unwrap();

        assert_eq!(bridge.status(), LiveStatus::Connecting);
        assert_eq!(bridge.epoch(), old_epoch + 1);
        assert_eq!(ledger.borrow().links_closed, 1);
        assert_eq!(ledger.borrow().mics_stopped, 1);

        // Signals tagged with the old epoch no longer apply.
        bridge
            .handle(LiveEvent::Session {
                epoch: old_epoch,
                signal: SessionSignal::Opened,
            })
            .unwrap();
        assert_eq!(bridge.status(), LiveStatus::Connecting);
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let slot = LiveSlot::new();
        let (mut bridge, _rx, ledger) = bridge_with(slot.clone());
        open(&mut bridge);

        drop(bridge);

        assert_released(&ledger);
        assert!(!slot.is_taken());
    }
}
