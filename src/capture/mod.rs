//! Capture Module - Mikrofon und Kamera
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Frames (4096 Samples @ 16 kHz, Mute-Gate)
//! - Kamera-Standbilder im 1-Sekunden-Takt (nur Video-Anrufe)
//! - Freigabe aller Geräte-Handles

mod microphone;
mod video;

pub use microphone::{AudioInput, FrameSink, MicrophoneCapture};
pub use video::{VideoCadence, VideoSurface};

use crate::config::CallConfig;
use crate::devices::MediaDevices;
use crate::playback::AudioError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Permission to access the {0} was denied")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable("microphone".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err }
                if err.description.to_lowercase().contains("permission") =>
            {
                CaptureError::PermissionDenied("microphone".to_string())
            }
            other => CaptureError::Audio(AudioError::StreamBuildError(other.to_string())),
        }
    }
}

// ============================================================================
// EVENTS & MUTE
// ============================================================================

/// Von der Capture-Pipeline erzeugte Frames
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Ein Fenster Mono-Samples @ 16 kHz
    Audio(Vec<f32>),
    /// Base64-kodiertes JPEG
    Video(String),
}

/// Geteilter Mute-Status (UI-Toggle und Capture-Callback)
#[derive(Debug, Clone, Default)]
pub struct MuteSwitch(Arc<AtomicBool>);

impl MuteSwitch {
    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn toggle(&self) -> bool {
        let muted = !self.0.fetch_xor(true, Ordering::SeqCst);
        tracing::debug!("Audio muted: {}", muted);
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// CAPTURE PIPELINE
// ============================================================================

/// Besitzt alle Eingabegeräte eines Anrufs
pub struct CapturePipeline {
    microphone: Option<Box<dyn AudioInput>>,
    surface: Option<Arc<dyn VideoSurface>>,
    video: Option<VideoCadence>,
    muted: MuteSwitch,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    video_interval: std::time::Duration,
    jpeg_quality: u8,
    started: bool,
}

impl CapturePipeline {
    /// Fordert Mikrofon (und bei Video die Kamera-Oberfläche) an
    ///
    /// Frames fließen erst nach [`CapturePipeline::start`].
    pub fn acquire(
        devices: &dyn MediaDevices,
        config: &CallConfig,
        surface: Option<Arc<dyn VideoSurface>>,
        muted: MuteSwitch,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CaptureEvent>), CaptureError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let sink = FrameSink::new(
            config.frame_size,
            config.input_sample_rate,
            muted.clone(),
            events_tx.clone(),
        );
        let microphone = devices.open_microphone(sink, config.input_sample_rate)?;

        Ok((
            Self {
                microphone: Some(microphone),
                surface,
                video: None,
                muted,
                events_tx,
                video_interval: config.video_interval(),
                jpeg_quality: config.jpeg_quality,
                started: false,
            },
            events_rx,
        ))
    }

    /// Startet Audio-Frames und (falls vorhanden) die Video-Kadenz
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.started {
            return Ok(());
        }

        let microphone = self
            .microphone
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable("microphone".to_string()))?;
        microphone.start()?;

        if let Some(surface) = &self.surface {
            self.video = Some(VideoCadence::start(
                Arc::clone(surface),
                self.video_interval,
                self.jpeg_quality,
                self.events_tx.clone(),
            ));
        }

        self.started = true;
        tracing::info!(
            "Capture started (video: {})",
            if self.video.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    /// Bricht die Video-Kadenz ab; `false` wenn nichts lief
    pub fn stop_video(&mut self) -> bool {
        match self.video.take() {
            Some(mut cadence) => cadence.stop(),
            None => false,
        }
    }

    /// Stoppt das Mikrofon und gibt Kamera-Oberfläche frei; `false` wenn schon frei
    pub fn stop_audio(&mut self) -> bool {
        self.surface = None;
        match self.microphone.take() {
            Some(mut microphone) => {
                microphone.stop();
                tracing::info!("Microphone released");
                true
            }
            None => false,
        }
    }

    /// Stoppt alles. Idempotent.
    pub fn stop(&mut self) {
        self.stop_video();
        self.stop_audio();
    }

    pub fn mute_switch(&self) -> MuteSwitch {
        self.muted.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.is_muted()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.microphone.is_none() && self.video.is_none()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
