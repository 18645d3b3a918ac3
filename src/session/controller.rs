//! Call Session Controller
//!
//! Ein tokio-Task pro Anruf besitzt Transport, Capture-Pipeline und
//! Playback-Scheduler und multiplext:
//! - Transport-Events (Open, Audio, Unterbrechung, Fehler, Close)
//! - Capture-Frames (Mikrofon, Kamera)
//! - Natürliche Enden der Wiedergabe
//! - Befehle vom Aufrufer (Auflegen)
//!
//! Der Teardown läuft genau einmal, egal über welchen Weg der Anruf endet.

use super::{CallError, CallEvent, CallInfo, CallMode, CallRequest, CallStatus};
use crate::capture::{CaptureEvent, CapturePipeline, MuteSwitch, VideoSurface};
use crate::codec::{self, MediaChunk};
use crate::config::CallConfig;
use crate::devices::MediaDevices;
use crate::playback::{AudioOutput, PlaybackScheduler, SourceId};
use crate::transport::{SessionTransport, Setup, TransportEvent};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

enum Command {
    Hangup(oneshot::Sender<()>),
}

// ============================================================================
// STATUS
// ============================================================================

/// Status plus Benachrichtigung; Error und Ended sind endgültig
#[derive(Clone)]
struct StatusCell {
    call_id: Uuid,
    status: Arc<RwLock<CallStatus>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl StatusCell {
    fn new(call_id: Uuid, event_tx: broadcast::Sender<CallEvent>) -> Self {
        let _ = event_tx.send(CallEvent::StatusChanged {
            call_id,
            status: CallStatus::Connecting,
        });
        Self {
            call_id,
            status: Arc::new(RwLock::new(CallStatus::Connecting)),
            event_tx,
        }
    }

    fn get(&self) -> CallStatus {
        *self.status.read()
    }

    fn set(&self, next: CallStatus) {
        // Event unter dem Lock senden, damit die Reihenfolge dem Status folgt
        let mut status = self.status.write();
        if *status == next || status.is_terminal() {
            return;
        }
        *status = next;
        tracing::info!("Call {} status: {:?}", self.call_id, next);
        let _ = self.event_tx.send(CallEvent::StatusChanged {
            call_id: self.call_id,
            status: next,
        });
    }

    fn fail(&self, message: String) {
        if self.get().is_terminal() {
            return;
        }
        let _ = self.event_tx.send(CallEvent::Error {
            call_id: self.call_id,
            message,
        });
        self.set(CallStatus::Error);
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Handle auf einen laufenden Anruf
///
/// Drop ohne vorheriges [`CallSession::hangup`] beendet den Anruf ebenfalls.
pub struct CallSession {
    info: CallInfo,
    status: StatusCell,
    muted: MuteSwitch,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl CallSession {
    /// Fordert die Geräte an, öffnet die Verbindung und startet den Session-Task
    ///
    /// Muss innerhalb einer tokio-Runtime aufgerufen werden. Geräte- und
    /// Konfigurationsfehler setzen den Status auf `Error` und werden
    /// zurückgegeben.
    pub fn start(
        request: CallRequest,
        config: &CallConfig,
        devices: &dyn MediaDevices,
        surface: Option<Arc<dyn VideoSurface>>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Result<Self, CallError> {
        let info = CallInfo::new(request);
        let status = StatusCell::new(info.id, event_tx);

        tracing::info!(
            "Starting {:?} call {} with {}",
            info.mode,
            info.id,
            info.peer_name
        );

        match Self::launch(&info, config, devices, surface, status.clone()) {
            Ok((muted, command_tx)) => Ok(Self {
                info,
                status,
                muted,
                command_tx,
            }),
            Err(e) => {
                tracing::error!("Failed to start call {}: {}", info.id, e);
                status.fail(e.to_string());
                Err(e)
            }
        }
    }

    fn launch(
        info: &CallInfo,
        config: &CallConfig,
        devices: &dyn MediaDevices,
        surface: Option<Arc<dyn VideoSurface>>,
        status: StatusCell,
    ) -> Result<(MuteSwitch, mpsc::UnboundedSender<Command>), CallError> {
        config.validate()?;
        let url = config.endpoint_url()?;

        let surface = match (info.mode, surface) {
            (CallMode::Video, Some(surface)) => Some(surface),
            (CallMode::Video, None) => {
                tracing::warn!("Video call without camera surface, sending audio only");
                None
            }
            (CallMode::Voice, _) => None,
        };

        // Geräte zuerst; schlägt die Ausgabe fehl, gibt der Drop der
        // Pipeline das Mikrofon wieder frei
        let muted = MuteSwitch::default();
        let (capture, capture_rx) =
            CapturePipeline::acquire(devices, config, surface, muted.clone())?;

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = devices.open_output(config.output_sample_rate, ended_tx)?;
        let scheduler = PlaybackScheduler::new(output);

        let setup = Setup::audio(
            config.model_resource(),
            config.voice.clone(),
            config.system_instruction_for(&info.peer_name),
        );
        let (transport, transport_rx) = SessionTransport::open(url, setup);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            status,
            transport,
            capture,
            scheduler,
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            torn_down: false,
        };
        tokio::spawn(task.run(transport_rx, capture_rx, ended_rx, command_rx));

        Ok((muted, command_tx))
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn status(&self) -> CallStatus {
        self.status.get()
    }

    /// `true` solange der Anruf weder beendet noch fehlgeschlagen ist
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.is_muted()
    }

    /// Unterdrückt das Senden, die Aufnahme läuft weiter
    pub fn set_muted(&self, muted: bool) {
        self.muted.set(muted);
        self.notify_mute(muted);
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = self.muted.toggle();
        self.notify_mute(muted);
        muted
    }

    fn notify_mute(&self, muted: bool) {
        let _ = self.status.event_tx.send(CallEvent::MuteChanged {
            call_id: self.info.id,
            muted,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.status.event_tx.subscribe()
    }

    /// Legt auf und wartet, bis alle Ressourcen freigegeben sind.
    /// Mehrfacher Aufruf ist harmlos.
    pub async fn hangup(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command_tx.send(Command::Hangup(reply_tx)).is_err() {
            tracing::debug!("Call {} already ended", self.info.id);
            return;
        }
        if reply_rx.await.is_err() {
            tracing::debug!("Call {} ended before hangup was acknowledged", self.info.id);
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.info.id)
            .field("mode", &self.info.mode)
            .field("status", &self.status())
            .field("muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct SessionTask {
    status: StatusCell,
    transport: SessionTransport,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler<Box<dyn AudioOutput>>,
    input_sample_rate: u32,
    output_sample_rate: u32,
    torn_down: bool,
}

impl SessionTask {
    async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut ended_rx: mpsc::UnboundedReceiver<SourceId>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            let flow = tokio::select! {
                biased;

                command = command_rx.recv() => {
                    match command {
                        Some(Command::Hangup(reply)) => {
                            self.end(CallStatus::Ended);
                            let _ = reply.send(());
                        }
                        None => {
                            tracing::debug!("Call handle dropped");
                            self.end(CallStatus::Ended);
                        }
                    }
                    ControlFlow::Break(())
                }

                Some(id) = ended_rx.recv() => {
                    self.scheduler.source_ended(id);
                    ControlFlow::Continue(())
                }

                event = transport_rx.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        self.end(CallStatus::Ended);
                        ControlFlow::Break(())
                    }
                },

                Some(frame) = capture_rx.recv() => {
                    self.on_capture_event(frame);
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        tracing::debug!("Call {} task finished", self.status.call_id);
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> ControlFlow<()> {
        match event {
            TransportEvent::Opened => {
                self.status.set(CallStatus::Connected);
                if let Err(e) = self.capture.start() {
                    tracing::error!("Failed to start capture: {}", e);
                    self.teardown();
                    self.status.fail(e.to_string());
                    return ControlFlow::Break(());
                }
            }
            TransportEvent::Audio(data) => self.play_chunk(&data),
            TransportEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                tracing::debug!("Barge-in, {} sources silenced", stopped);
            }
            TransportEvent::TurnComplete => {
                tracing::debug!("Agent turn complete");
            }
            TransportEvent::Error(e) => {
                tracing::error!("Call {} transport failed: {}", self.status.call_id, e);
                self.teardown();
                self.status.fail(e.to_string());
                return ControlFlow::Break(());
            }
            TransportEvent::Closed { reason } => {
                tracing::info!("Agent ended the call (reason: {:?})", reason);
                self.end(CallStatus::Ended);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn play_chunk(&mut self, data: &str) {
        let decoded = codec::decode(data)
            .and_then(|bytes| codec::decode_audio_data(&bytes, self.output_sample_rate, 1));

        let buffer = match decoded {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("Skipping undecodable audio chunk: {}", e);
                return;
            }
        };

        if let Err(e) = self.scheduler.schedule(&buffer) {
            tracing::warn!("Failed to schedule audio chunk: {}", e);
        }
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        if self.torn_down {
            return;
        }

        let chunk = match event {
            CaptureEvent::Audio(samples) => {
                if self.capture.is_muted() {
                    return;
                }
                MediaChunk::audio(&samples, self.input_sample_rate)
            }
            CaptureEvent::Video(data) => MediaChunk::jpeg(data),
        };

        if let Err(e) = self.transport.send(chunk) {
            tracing::debug!("Frame not sent: {}", e);
        }
    }

    fn end(&mut self, status: CallStatus) {
        self.teardown();
        self.status.set(status);
    }

    /// Gibt alles frei; jeder Schritt läuft unabhängig von den anderen
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        tracing::info!("Tearing down call {}", self.status.call_id);

        self.transport.close();

        if self.capture.stop_video() {
            tracing::debug!("Video cadence cancelled");
        }
        if !self.capture.stop_audio() {
            tracing::debug!("Microphone was already released");
        }

        self.scheduler.interrupt();
        if let Err(e) = self.scheduler.close() {
            tracing::warn!("Failed to release audio output: {}", e);
        }
    }
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ============================================================================
// TESTS
// ============================================================================
