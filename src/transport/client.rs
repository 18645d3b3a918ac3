//! WebSocket Session zum Agenten
//!
//! Verwaltet die eine bidirektionale Verbindung eines Anrufs:
//! - Zustandsmaschine Connecting -> Connected -> (Error | Closed)
//! - Ausgehende Queue, die bis zum Abschluss des Handshakes puffert
//! - Event-Stream für Audio, Unterbrechungen und Verbindungsende

use super::messages::{ClientMessage, ServerMessage, Setup};
use crate::codec::MediaChunk;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Session handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Session is closed")]
    Closed,
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

/// Zustand der Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    /// Verbindung und Setup laufen
    Connecting,
    /// `setupComplete` empfangen, Queue wird geleert
    Connected,
    /// Transportfehler
    Error(String),
    /// Lokal oder vom Server geschlossen
    Closed,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Error(_) | TransportState::Closed)
    }
}

/// Events in Ankunftsreihenfolge
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake abgeschlossen
    Opened,
    /// Base64-kodierter PCM-Chunk
    Audio(String),
    /// Barge-in: Wiedergabe sofort stoppen
    Interrupted,
    /// Der Agent hat seinen Turn beendet
    TurnComplete,
    /// Fataler Transportfehler
    Error(TransportError),
    /// Vom Server geschlossen
    Closed { reason: Option<String> },
}

// ============================================================================
// SESSION TRANSPORT
// ============================================================================

/// Die eine Streaming-Verbindung eines Anrufs
pub struct SessionTransport {
    state: Arc<RwLock<TransportState>>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    host: String,
}

impl SessionTransport {
    /// Startet Verbindung und Handshake im Hintergrund
    ///
    /// Kehrt sofort im Zustand `Connecting` zurück; `send` kann ab sofort
    /// benutzt werden.
    pub fn open(url: Url, setup: Setup) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let state = Arc::new(RwLock::new(TransportState::Connecting));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let host = url.host_str().unwrap_or_default().to_string();

        tracing::info!("Connecting to agent at {}", host);

        let driver = Driver {
            state: Arc::clone(&state),
            events_tx,
        };
        let task = tokio::spawn(driver.run(url, setup, outbound_rx, close_rx));

        (
            Self {
                state,
                outbound_tx,
                close_tx: Mutex::new(Some(close_tx)),
                task: Mutex::new(Some(task)),
                host,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> TransportState {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == TransportState::Connected
    }

    /// Reiht einen Medien-Chunk ein (nicht blockierend)
    ///
    /// Vor `Connected` wird gepuffert und danach in Reihenfolge gesendet.
    pub fn send(&self, chunk: MediaChunk) -> Result<(), TransportError> {
        if self.state.read().is_terminal() {
            tracing::trace!("Dropping {} chunk, session is closed", chunk.mime_type);
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(ClientMessage::media(chunk))
            .map_err(|_| TransportError::Closed)
    }

    /// Schließt die Verbindung. Wirft nie; mehrfacher Aufruf ist harmlos.
    pub fn close(&self) {
        match self.close_tx.lock().take() {
            Some(close_tx) => {
                if close_tx.send(()).is_err() {
                    tracing::debug!("Transport task already finished");
                }
                tracing::info!("Closing agent session ({})", self.host);
            }
            None => tracing::debug!("Agent session already closed"),
        }

        let mut state = self.state.write();
        if !state.is_terminal() {
            *state = TransportState::Closed;
        }
    }

    /// Wartet, bis der Hintergrund-Task beendet ist
    pub async fn closed(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Transport task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("host", &self.host)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Ergebnis der Handshake-Phase
enum Handshake {
    Complete,
    Stop,
}

struct Driver {
    state: Arc<RwLock<TransportState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Driver {
    async fn run(
        self,
        url: Url,
        setup: Setup,
        mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        let connect = connect_async(url.as_str());
        let ws_stream = tokio::select! {
            result = connect => match result {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    self.fail(TransportError::ConnectionFailed(e.to_string()));
                    return;
                }
            },
            _ = &mut close_rx => {
                tracing::debug!("Session closed before the connection was established");
                self.set_closed();
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        // Setup senden
        let setup_json = match serde_json::to_string(&ClientMessage::Setup(setup)) {
            Ok(json) => json,
            Err(e) => {
                self.fail(TransportError::HandshakeFailed(e.to_string()));
                return;
            }
        };
        if let Err(e) = write.send(Message::Text(setup_json)).await {
            self.fail(TransportError::HandshakeFailed(e.to_string()));
            return;
        }

        // Auf setupComplete warten; ausgehende Frames bleiben in der Queue
        let handshake = loop {
            tokio::select! {
                _ = &mut close_rx => break Handshake::Stop,
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.handshake_message(text.as_bytes()) {
                            break Handshake::Complete;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if self.handshake_message(&bytes) {
                            break Handshake::Complete;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        self.remote_closed(frame.map(|f| f.reason.to_string()));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.fail(TransportError::HandshakeFailed(e.to_string()));
                        return;
                    }
                    None => {
                        self.remote_closed(None);
                        return;
                    }
                },
            }
        };

        if let Handshake::Stop = handshake {
            if let Err(e) = write.send(Message::Close(None)).await {
                tracing::warn!("Failed to close WebSocket during handshake: {}", e);
            }
            self.set_closed();
            return;
        }

        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = TransportState::Connected;
        }
        tracing::info!("Agent session established");
        let _ = self.events_tx.send(TransportEvent::Opened);

        let mut sent: u64 = 0;
        loop {
            tokio::select! {
                biased;

                _ = &mut close_rx => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::warn!("Failed to close WebSocket: {}", e);
                    }
                    self.set_closed();
                    break;
                }

                outbound = outbound_rx.recv() => {
                    let Some(message) = outbound else {
                        // Handle gedroppt
                        let _ = write.send(Message::Close(None)).await;
                        self.set_closed();
                        break;
                    };

                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!("Dropping unserializable message: {}", e);
                            continue;
                        }
                    };

                    if let Err(e) = write.send(Message::Text(json)).await {
                        self.fail(TransportError::SendFailed(e.to_string()));
                        break;
                    }
                    sent += 1;
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.dispatch(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        self.remote_closed(frame.map(|f| f.reason.to_string()));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.fail(TransportError::ConnectionLost(e.to_string()));
                        break;
                    }
                    None => {
                        self.remote_closed(None);
                        break;
                    }
                },
            }
        }

        tracing::debug!("Transport task finished ({} messages sent)", sent);
    }

    /// `true` sobald `setupComplete` gelesen wurde
    fn handshake_message(&self, bytes: &[u8]) -> bool {
        match serde_json::from_slice::<ServerMessage>(bytes) {
            Ok(msg) if msg.is_setup_complete() => true,
            Ok(msg) => {
                tracing::debug!("Ignoring message before setupComplete: {:?}", msg);
                false
            }
            Err(e) => {
                tracing::warn!("Unparseable handshake message: {}", e);
                false
            }
        }
    }

    fn dispatch(&self, bytes: &[u8]) {
        let msg = match serde_json::from_slice::<ServerMessage>(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Unparseable server message: {}", e);
                return;
            }
        };

        for event in server_events(&msg) {
            let _ = self.events_tx.send(event);
        }
    }

    fn fail(&self, err: TransportError) {
        {
            let mut state = self.state.write();
            if *state == TransportState::Closed {
                tracing::debug!("Ignoring transport error after close: {}", err);
                return;
            }
            *state = TransportState::Error(err.to_string());
        }
        tracing::error!("Transport error: {}", err);
        let _ = self.events_tx.send(TransportEvent::Error(err));
    }

    fn remote_closed(&self, reason: Option<String>) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = TransportState::Closed;
        }
        tracing::info!("Agent session closed by server (reason: {:?})", reason);
        let _ = self.events_tx.send(TransportEvent::Closed { reason });
    }

    fn set_closed(&self) {
        let mut state = self.state.write();
        if !matches!(*state, TransportState::Error(_)) {
            *state = TransportState::Closed;
        }
    }
}

/// Übersetzt eine Server-Nachricht in Events (Audio vor Unterbrechung)
fn server_events(msg: &ServerMessage) -> Vec<TransportEvent> {
    let mut events: Vec<TransportEvent> = msg
        .audio_payloads()
        .into_iter()
        .map(|data| TransportEvent::Audio(data.to_string()))
        .collect();

    if msg.is_interrupted() {
        events.push(TransportEvent::Interrupted);
    }
    if msg.is_turn_complete() {
        events.push(TransportEvent::TurnComplete);
    }
    if msg.go_away.is_some() {
        tracing::warn!("Server announced disconnect: {:?}", msg.go_away);
    }
    events
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, MockAgent};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> Setup {
        Setup::audio(
            "models/test".to_string(),
            "Puck".to_string(),
            "You are on a call with Alex.".to_string(),
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_frames_before_handshake_are_flushed_in_order() {
        let mut agent = MockAgent::start().await;
        let (transport, mut events) = SessionTransport::open(agent.url(), setup());
        assert_eq!(transport.state(), TransportState::Connecting);

        for data in ["one", "two", "three"] {
            transport.send(MediaChunk::jpeg(data.to_string())).unwrap();
        }

        let mut conn = agent.accept().await;
        let first = conn.recv_json().await.unwrap();
        assert_eq!(first["setup"]["model"], "models/test");
        assert_eq!(
            first["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );

        // Vor setupComplete darf nichts weiteres ankommen
        assert!(conn.recv_json_within(Duration::from_millis(100)).await.is_none());

        conn.send_json(json!({ "setupComplete": {} })).await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);
        assert!(transport.is_connected());

        for expected in ["one", "two", "three"] {
            let msg = conn.recv_json().await.unwrap();
            assert_eq!(msg["realtimeInput"]["mediaChunks"][0]["data"], expected);
        }

        // Nach dem Handshake geht es direkt durch
        transport.send(MediaChunk::jpeg("four".to_string())).unwrap();
        let msg = conn.recv_json().await.unwrap();
        assert_eq!(msg["realtimeInput"]["mediaChunks"][0]["data"], "four");
    }

    #[tokio::test]
    async fn test_inbound_events_in_arrival_order() {
        let mut agent = MockAgent::start().await;
        let (_transport, mut events) = SessionTransport::open(agent.url(), setup());
        let mut conn = agent.accept().await;
        conn.complete_setup().await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

        conn.send_json(json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } }] },
                "interrupted": true
            }
        }))
        .await;
        conn.send_binary_json(json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "BBB=" } }] },
                "turnComplete": true
            }
        }))
        .await;

        assert_eq!(next_event(&mut events).await, TransportEvent::Audio("AAA=".into()));
        assert_eq!(next_event(&mut events).await, TransportEvent::Interrupted);
        assert_eq!(next_event(&mut events).await, TransportEvent::Audio("BBB=".into()));
        assert_eq!(next_event(&mut events).await, TransportEvent::TurnComplete);
    }

    #[tokio::test]
    async fn test_close_before_handshake_is_safe() {
        let mut agent = MockAgent::start().await;
        let (transport, mut events) = SessionTransport::open(agent.url(), setup());
        let mut conn = agent.accept().await;
        let _setup = conn.recv_json().await.unwrap();

        transport.close();
        transport.close();
        assert_eq!(transport.state(), TransportState::Closed);
        transport.closed().await;

        assert!(conn.wait_closed().await);
        assert!(events.recv().await.is_none());
        assert_eq!(
            transport.send(MediaChunk::jpeg("late".to_string())),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_connection_failure_reports_error() {
        let url = MockAgent::unreachable_url().await;
        let (transport, mut events) = SessionTransport::open(url, setup());

        match next_event(&mut events).await {
            TransportEvent::Error(TransportError::ConnectionFailed(_)) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(transport.state(), TransportState::Error(_)));

        // close nach Fehler bleibt still
        transport.close();
        assert!(matches!(transport.state(), TransportState::Error(_)));
    }

    #[tokio::test]
    async fn test_remote_close_is_reported() {
        let mut agent = MockAgent::start().await;
        let (transport, mut events) = SessionTransport::open(agent.url(), setup());
        let mut conn = agent.accept().await;
        conn.complete_setup().await;
        assert_eq!(next_event(&mut events).await, TransportEvent::Opened);

        conn.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Closed { .. }
        ));
        wait_for(|| transport.state() == TransportState::Closed).await;
        assert_eq!(
            transport.send(MediaChunk::jpeg("late".to_string())),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_server_events_audio_before_interrupt() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": { "parts": [{ "inlineData": { "data": "AAA=" } }] }
            }
        }))
        .unwrap();

        assert_eq!(
            server_events(&msg),
            vec![TransportEvent::Audio("AAA=".into()), TransportEvent::Interrupted]
        );
    }
}
