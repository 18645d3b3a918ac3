//! Anruf-Konfiguration
//!
//! Defaults entsprechen dem Live-Endpunkt des Agenten; Umgebungsvariablen
//! überschreiben Endpunkt, Schlüssel, Modell und Stimme.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Standard-Endpunkt (BidiGenerateContent über WebSocket)
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

pub const DEFAULT_VOICE: &str = "Puck";

/// `{peer}` wird durch den Namen des Gesprächspartners ersetzt
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful hostel management assistant. \
You are on a call with {peer}. Help them with hostel rules, food queries, or general student \
life. Keep it friendly and informal.";

/// Eingangs-Rate (Mikrofon -> Agent)
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Ausgangs-Rate (Agent -> Lautsprecher)
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Samples pro Capture-Frame (~256 ms @ 16 kHz)
pub const FRAME_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No API key configured (set GEMINI_API_KEY or API_KEY)")]
    MissingApiKey,

    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("Invalid {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub video_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            video_interval_ms: 1000,
            jpeg_quality: 50,
        }
    }
}

impl CallConfig {
    /// Defaults plus Überschreibungen aus der Umgebung
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup("GEMINI_API_KEY").or_else(|| lookup("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("LIVE_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(model) = lookup("LIVE_MODEL") {
            self.model = model;
        }
        if let Some(voice) = lookup("LIVE_VOICE") {
            self.voice = voice;
        }
        self
    }

    /// Prüft Werte, die Geräte oder Frame-Zerlegung unbrauchbar machen
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::InvalidValue { field, reason });

        if self.frame_size == 0 {
            return invalid("frame_size", "must be at least 1 sample");
        }
        if self.input_sample_rate == 0 {
            return invalid("input_sample_rate", "must be non-zero");
        }
        if self.output_sample_rate == 0 {
            return invalid("output_sample_rate", "must be non-zero");
        }
        if self.video_interval_ms == 0 {
            return invalid("video_interval_ms", "must be non-zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality", "must be between 1 and 100");
        }
        Ok(())
    }

    /// Vollständige WebSocket-URL inklusive Schlüssel
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.endpoint)?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        } else if url.scheme() == "wss" {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(url)
    }

    /// Modellname in der Form, die der Setup-Nachricht erwartet wird
    pub fn model_resource(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Persona-Text für einen konkreten Gesprächspartner
    pub fn system_instruction_for(&self, peer_name: &str) -> String {
        self.system_instruction.replace("{peer}", peer_name)
    }

    pub fn video_interval(&self) -> Duration {
        Duration::from_millis(self.video_interval_ms.max(1))
    }
}
