//! Gerätezugriff - Mikrofon und Ausgabe-Kontext
//!
//! [`MediaDevices`] ist die Grenze zum Betriebssystem. [`SystemDevices`]
//! öffnet die Standardgeräte über cpal.

use crate::capture::{AudioInput, CaptureError, FrameSink, MicrophoneCapture};
use crate::playback::{AudioError, AudioOutput, SourceId, SpeakerOutput};
use cpal::traits::HostTrait;
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use tokio::sync::mpsc;

/// Zugriff auf Eingabe- und Ausgabegeräte
pub trait MediaDevices: Send + Sync {
    /// Fordert das Mikrofon an; Frames landen im `sink`
    fn open_microphone(
        &self,
        sink: FrameSink,
        sample_rate: u32,
    ) -> Result<Box<dyn AudioInput>, CaptureError>;

    /// Öffnet den Ausgabe-Kontext; natürliche Enden gehen an `ended_tx`
    fn open_output(
        &self,
        sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// Standardgeräte des Systems (cpal default host)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl MediaDevices for SystemDevices {
    fn open_microphone(
        &self,
        sink: FrameSink,
        sample_rate: u32,
    ) -> Result<Box<dyn AudioInput>, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no audio input device".to_string()))?;

        Ok(Box::new(MicrophoneCapture::open(device, sink, sample_rate)?))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        Ok(Box::new(SpeakerOutput::open(device, sample_rate, ended_tx)?))
    }
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn start_source(
        &mut self,
        id: SourceId,
        buffer: &crate::codec::AudioBuffer,
        when: f64,
    ) -> Result<f64, AudioError> {
        (**self).start_source(id, buffer, when)
    }

    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        (**self).stop_source(id)
    }

    fn close(&mut self) -> Result<(), AudioError> {
        (**self).close()
    }
}

/// Wählt die beste F32-Konfiguration für die gewünschte Sample-Rate
///
/// Die Streams werden immer mit `f32`-Callbacks gebaut; Geräte ohne F32
/// werden abgelehnt statt später am Stream-Aufbau zu scheitern.
pub(crate) fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    // Priorität: exakte Rate > nächstbeste Rate
    let target_rate = cpal::SampleRate(target_sample_rate);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            let rate = if config.max_sample_rate() < target_rate {
                config.max_sample_rate()
            } else {
                config.min_sample_rate().max(target_rate.min(config.max_sample_rate()))
            };
            return Ok(config.clone().with_sample_rate(rate).into());
        }
    }

    Err(AudioError::UnsupportedConfig(format!(
        "No F32 audio configuration among {} offered",
        configs.len()
    )))
}
