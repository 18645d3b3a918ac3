//! Live Call - Sprach- und Videoanrufe mit einem Konversations-Agenten
//!
//! Der Kern einer Chat-App, der einen Live-Anruf betreibt:
//! - Mikrofon (und optional Kamera) aufnehmen und als PCM/JPEG streamen
//! - Eine WebSocket-Session zum Agenten mit ausgehender Queue
//! - Lückenlose Wiedergabe der Antwort-Chunks mit Barge-in
//! - Vollständiger, idempotenter Teardown aller Geräte

pub mod capture;
pub mod codec;
pub mod config;
pub mod devices;
pub mod playback;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

use anyhow::anyhow;
use capture::VideoSurface;
use config::CallConfig;
use devices::{MediaDevices, SystemDevices};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use session::{CallError, CallEvent, CallInfo, CallRequest, CallSession, CallStatus};
use std::sync::Arc;
use tokio::sync::broadcast;

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den tracing-Subscriber (`RUST_LOG` plus Defaults)
///
/// Mehrfacher Aufruf ist erlaubt; nur der erste wirkt.
pub fn init_logging() {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();
    let filter =
        tracing_subscriber::EnvFilter::new(format!("live_call=debug,tungstenite=warn,{directives}"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Globaler Application State - die Schnittstelle zur Chat-Oberfläche
pub struct AppState {
    config: CallConfig,
    devices: Arc<dyn MediaDevices>,
    session: Mutex<Option<CallSession>>,
    event_tx: broadcast::Sender<CallEvent>,
}

/// Singleton für den AppState
static APP_STATE: OnceCell<Arc<AppState>> = OnceCell::new();

impl AppState {
    pub fn new(config: CallConfig, devices: Arc<dyn MediaDevices>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            devices,
            session: Mutex::new(None),
            event_tx,
        }
    }

    /// Initialisiert Logging und den globalen State mit den Systemgeräten
    pub fn init(config: CallConfig) -> anyhow::Result<Arc<Self>> {
        init_logging();
        tracing::info!("Initializing live call core...");

        if config.api_key.is_none() {
            tracing::warn!("No API key configured, calls to the hosted agent will fail");
        }

        let state = Arc::new(Self::new(config, Arc::new(SystemDevices)));
        APP_STATE
            .set(Arc::clone(&state))
            .map_err(|_| anyhow!("AppState already initialized"))?;

        Ok(state)
    }

    /// Gibt den globalen AppState zurück
    pub fn get() -> Option<Arc<Self>> {
        APP_STATE.get().cloned()
    }

    /// Startet einen Anruf; höchstens einer ist gleichzeitig aktiv
    ///
    /// `surface` liefert bei Videoanrufen die Kamerabilder.
    pub fn start_call(
        &self,
        request: CallRequest,
        surface: Option<Arc<dyn VideoSurface>>,
    ) -> Result<CallInfo, CallError> {
        let mut current = self.session.lock();
        if current.as_ref().is_some_and(|s| s.is_active()) {
            return Err(CallError::AlreadyInCall);
        }

        let session = CallSession::start(
            request,
            &self.config,
            self.devices.as_ref(),
            surface,
            self.event_tx.clone(),
        )?;
        let info = session.info().clone();
        *current = Some(session);
        Ok(info)
    }

    /// Legt auf und wartet auf die Freigabe aller Ressourcen
    pub async fn end_call(&self) -> Result<(), CallError> {
        let session = self.session.lock().take().ok_or(CallError::NoActiveCall)?;
        session.hangup().await;
        tracing::info!("Call {} ended", session.id());
        Ok(())
    }

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(CallError::NoActiveCall)?;
        Ok(session.toggle_mute())
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(CallError::NoActiveCall)?;
        session.set_muted(muted);
        Ok(())
    }

    /// Status des aktuellen (oder zuletzt beendeten) Anrufs; `None` ohne Anruf
    pub fn status(&self) -> Option<CallStatus> {
        self.session.lock().as_ref().map(|s| s.status())
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.session.lock().as_ref().map(|s| s.info().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }
}

// ============================================================================
// TESTS
// ============================================================================
