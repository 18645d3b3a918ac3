//! Test-Hilfen: Fake-Geräte, manuelle Ausgabe-Uhr und ein Loopback-Agent

use crate::capture::{AudioInput, CaptureError, FrameSink, VideoSurface};
use crate::codec::{self, AudioBuffer, RgbFrame};
use crate::devices::MediaDevices;
use crate::playback::{AudioError, AudioOutput, SourceId};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Pollt `condition`, bis sie wahr ist (max. 2 s)
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", RECV_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// FAKE OUTPUT
// ============================================================================

/// Manuell gestellte Ausgabe-Uhr
#[derive(Clone, Default)]
pub struct FakeClock(Arc<Mutex<f64>>);

impl FakeClock {
    pub fn set(&self, seconds: f64) {
        *self.0.lock() = seconds;
    }

    pub fn get(&self) -> f64 {
        *self.0.lock()
    }
}

#[derive(Default)]
struct OutputRecord {
    started: Vec<(SourceId, f64, f64)>,
    active: BTreeSet<SourceId>,
    stopped: Vec<SourceId>,
    close_count: usize,
    ended_tx: Option<mpsc::UnboundedSender<SourceId>>,
}

/// Protokoll aller Aufrufe auf einer [`FakeOutput`]
#[derive(Clone, Default)]
pub struct OutputLog(Arc<Mutex<OutputRecord>>);

impl OutputLog {
    /// `(id, start, dauer)` in Aufrufreihenfolge
    pub fn started(&self) -> Vec<(SourceId, f64, f64)> {
        self.0.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.0.lock().stopped.clone()
    }

    pub fn active(&self) -> usize {
        self.0.lock().active.len()
    }

    pub fn close_count(&self) -> usize {
        self.0.lock().close_count
    }

    /// Simuliert das natürliche Ende einer Quelle
    pub fn finish(&self, id: SourceId) {
        let mut record = self.0.lock();
        if record.active.remove(&id) {
            if let Some(tx) = &record.ended_tx {
                let _ = tx.send(id);
            }
        }
    }
}

pub struct FakeOutput {
    clock: FakeClock,
    log: OutputLog,
    /// Uhr läuft zwischen `current_time` und `start_source` weiter
    advance_on_start: f64,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self {
            clock: FakeClock::default(),
            log: OutputLog::default(),
            advance_on_start: 0.0,
        }
    }

    /// Wie ein Audio-Callback, der zwischen zwei Aufrufen einen Block rendert
    pub fn advancing_on_start(seconds: f64) -> Self {
        Self {
            advance_on_start: seconds,
            ..Self::new()
        }
    }

    pub fn clock(&self) -> FakeClock {
        self.clock.clone()
    }

    pub fn log(&self) -> OutputLog {
        self.log.clone()
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.clock.get()
    }

    fn start_source(
        &mut self,
        id: SourceId,
        buffer: &AudioBuffer,
        when: f64,
    ) -> Result<f64, AudioError> {
        let mut record = self.log.0.lock();
        if record.close_count > 0 {
            return Err(AudioError::Closed);
        }
        let now = self.clock.get() + self.advance_on_start;
        self.clock.set(now);
        let start = when.max(now);
        record.started.push((id, start, buffer.duration()));
        record.active.insert(id);
        Ok(start)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        let mut record = self.log.0.lock();
        if record.active.remove(&id) {
            record.stopped.push(id);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let mut record = self.log.0.lock();
        record.close_count += 1;
        record.active.clear();
        if record.close_count > 1 {
            return Err(AudioError::Closed);
        }
        Ok(())
    }
}

// ============================================================================
// FAKE MICROPHONE
// ============================================================================

#[derive(Default)]
struct MicState {
    sink: Option<FrameSink>,
    started: bool,
    samples_captured: usize,
    start_count: usize,
    stop_count: usize,
}

/// Test-Handle auf das Fake-Mikrofon
#[derive(Clone, Default)]
pub struct FakeMicrophone(Arc<Mutex<MicState>>);

impl FakeMicrophone {
    /// Liefert Samples wie ein Geräte-Callback (nur solange gestartet)
    pub fn feed(&self, samples: &[f32]) {
        let mut state = self.0.lock();
        if !state.started {
            return;
        }
        state.samples_captured += samples.len();
        if let Some(sink) = state.sink.as_mut() {
            sink.push_interleaved(samples);
        }
    }

    pub fn samples_captured(&self) -> usize {
        self.0.lock().samples_captured
    }

    pub fn start_count(&self) -> usize {
        self.0.lock().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.0.lock().stop_count
    }
}

struct FakeMicInput(Arc<Mutex<MicState>>);

impl AudioInput for FakeMicInput {
    fn start(&mut self) -> Result<(), CaptureError> {
        let mut state = self.0.lock();
        if state.sink.is_none() {
            return Err(CaptureError::DeviceUnavailable("microphone".to_string()));
        }
        state.started = true;
        state.start_count += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.0.lock();
        if state.sink.take().is_some() {
            state.started = false;
            state.stop_count += 1;
        }
    }
}

// ============================================================================
// FAKE DEVICES
// ============================================================================

pub struct FakeDevices {
    microphone: FakeMicrophone,
    output: FakeOutput,
    deny_microphone: AtomicBool,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            microphone: FakeMicrophone::default(),
            output: FakeOutput::new(),
            deny_microphone: AtomicBool::new(false),
        }
    }

    pub fn microphone(&self) -> FakeMicrophone {
        self.microphone.clone()
    }

    pub fn clock(&self) -> FakeClock {
        self.output.clock()
    }

    pub fn output_log(&self) -> OutputLog {
        self.output.log()
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }
}

impl MediaDevices for FakeDevices {
    fn open_microphone(
        &self,
        sink: FrameSink,
        _sample_rate: u32,
    ) -> Result<Box<dyn AudioInput>, CaptureError> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("microphone".to_string()));
        }
        {
            let mut state = self.microphone.0.lock();
            state.sink = Some(sink);
            state.started = false;
        }
        Ok(Box::new(FakeMicInput(Arc::clone(&self.microphone.0))))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError> {
        self.output.log.0.lock().ended_tx = Some(ended_tx);
        Ok(Box::new(FakeOutput {
            clock: self.output.clock(),
            log: self.output.log(),
            advance_on_start: 0.0,
        }))
    }
}

// ============================================================================
// FAKE SURFACE
// ============================================================================

pub struct FakeSurface {
    ready: AtomicBool,
    grabs: AtomicUsize,
}

impl FakeSurface {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            grabs: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn grab_count(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

impl VideoSurface for FakeSurface {
    fn grab_frame(&self) -> Option<RgbFrame> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        if !self.ready.load(Ordering::SeqCst) {
            return None;
        }
        Some(RgbFrame {
            width: 8,
            height: 8,
            data: vec![128; 8 * 8 * 3],
        })
    }
}

// ============================================================================
// MOCK AGENT
// ============================================================================

/// Lokaler WebSocket-Server, der den Agenten spielt
pub struct MockAgent {
    listener: TcpListener,
    url: Url,
}

impl MockAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = Url::parse(&format!("ws://{}/live", addr)).unwrap();
        Self { listener, url }
    }

    /// URL, unter der garantiert niemand lauscht
    pub async fn unreachable_url() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Url::parse(&format!("ws://{}/live", addr)).unwrap()
    }

    pub fn url(&self) -> Url {
        self.url.clone()
    }

    pub async fn accept(&mut self) -> MockConnection {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        MockConnection { ws }
    }
}

pub struct MockConnection {
    ws: WebSocketStream<TcpStream>,
}

impl MockConnection {
    pub async fn recv_json(&mut self) -> Option<Value> {
        let value = self.recv_json_within(RECV_TIMEOUT).await;
        assert!(value.is_some(), "agent received nothing");
        value
    }

    /// `None` bei Timeout oder geschlossener Verbindung
    pub async fn recv_json_within(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Binary(bytes)) => return serde_json::from_slice(&bytes).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    pub async fn send_binary_json(&mut self, value: Value) {
        self.ws
            .send(Message::Binary(value.to_string().into_bytes()))
            .await
            .unwrap();
    }

    /// Liest die Setup-Nachricht und bestätigt sie
    pub async fn complete_setup(&mut self) -> Value {
        let setup = self.recv_json().await.unwrap();
        assert!(setup.get("setup").is_some(), "expected setup, got {}", setup);
        self.send_json(json!({ "setupComplete": {} })).await;
        setup
    }

    pub async fn send_audio(&mut self, samples: &[f32]) {
        self.send_json(json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": {
                    "mimeType": "audio/pcm;rate=24000",
                    "data": codec::encode(samples)
                } }] }
            }
        }))
        .await;
    }

    pub async fn send_interrupted(&mut self) {
        self.send_json(json!({ "serverContent": { "interrupted": true } }))
            .await;
    }

    pub async fn close(&mut self) {
        self.ws.close(None).await.unwrap();
    }

    /// `true` sobald der Client die Verbindung beendet hat
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }
}
