//! Session Module - Steuerung eines Live-Anrufs
//!
//! Ein Anruf besitzt genau eine Transport-Verbindung, eine Capture-Pipeline
//! und einen Playback-Scheduler. Der Controller verdrahtet sie und räumt
//! beim Ende (egal auf welchem Weg) alles genau einmal ab.

mod controller;

pub use controller::CallSession;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::playback::AudioError;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Für den Aufrufer sichtbarer Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Geräte angefordert, Handshake läuft
    Connecting,
    /// Agent verbunden, Capture läuft
    Connected,
    /// Geräte- oder Transportfehler
    Error,
    /// Aufgelegt oder vom Agenten beendet
    Ended,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Error | CallStatus::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Voice,
    Video,
}

/// Parameter von "Anruf starten"
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub peer_name: String,
    #[serde(default)]
    pub peer_avatar: Option<String>,
    #[serde(default)]
    pub is_video: bool,
}

impl CallRequest {
    pub fn voice(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            peer_avatar: None,
            is_video: false,
        }
    }
}

/// Metadaten eines Anrufs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub id: Uuid,
    pub peer_name: String,
    pub peer_avatar: Option<String>,
    pub mode: CallMode,
    pub started_at: DateTime<Utc>,
}

impl CallInfo {
    pub(crate) fn new(request: CallRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_name: request.peer_name,
            peer_avatar: request.peer_avatar,
            mode: if request.is_video {
                CallMode::Video
            } else {
                CallMode::Voice
            },
            started_at: Utc::now(),
        }
    }
}

/// Events an die Oberfläche
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StatusChanged { call_id: Uuid, status: CallStatus },
    MuteChanged { call_id: Uuid, muted: bool },
    Error { call_id: Uuid, message: String },
}
