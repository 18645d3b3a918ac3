//! Audio Output - Ausgabe-Kontext mit gemeinsamer Zeitachse
//!
//! Der Ausgabe-Kontext verhält sich wie ein kleiner Mixer: Puffer werden auf
//! eine absolute Startzeit der Ausgabe-Uhr gelegt, können einzeln gestoppt
//! werden und melden ihr natürliches Ende über einen Channel.
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Der cpal-Stream ist nicht
//! Send, daher lebt er auf einem eigenen Thread und wird nur über den
//! geteilten Mixer angesprochen.

use crate::codec::resample::RESAMPLE_CHUNK;
use crate::codec::{resample_linear, AudioBuffer, StreamResampler};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Device;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio device thread failed: {0}")]
    DeviceThread(String),

    #[error("Audio output already closed")]
    Closed,
}

// ============================================================================
// OUTPUT TRAIT
// ============================================================================

/// Kennung einer geplanten Quelle
pub type SourceId = u64;

/// Ausgabe-Kontext, auf dem der Scheduler Puffer plant
pub trait AudioOutput: Send {
    /// Aktuelle Zeit der Ausgabe-Uhr in Sekunden
    fn current_time(&self) -> f64;

    /// Startet `buffer` zur Zeit `when` (Sekunden auf der Ausgabe-Uhr)
    ///
    /// Gibt die tatsächliche Startzeit zurück. Sie weicht nur ab, wenn `when`
    /// inzwischen vor der Uhr liegt.
    fn start_source(
        &mut self,
        id: SourceId,
        buffer: &AudioBuffer,
        when: f64,
    ) -> Result<f64, AudioError>;

    /// Stoppt eine Quelle sofort. Bereits beendete Quellen sind ein No-Op.
    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError>;

    /// Gibt den Kontext (und das Gerät) frei
    fn close(&mut self) -> Result<(), AudioError>;
}

// ============================================================================
// MIXER
// ============================================================================

struct MixerSource {
    id: SourceId,
    start_frame: u64,
    /// Planar, auf der Rate der Zeitachse
    channels: Vec<Vec<f32>>,
}

impl MixerSource {
    fn len(&self) -> u64 {
        self.channels.first().map(|c| c.len()).unwrap_or(0) as u64
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.len()
    }
}

/// Zeitachse + aktive Quellen, geteilt mit dem Audio-Callback
///
/// Die Zeitachse läuft mit der Rate der eingehenden Puffer. Weicht das Gerät
/// davon ab, wird die fertige Mischung blockweise durch einen durchgehenden
/// Resampler pro Gerätekanal geschickt. Die Uhr läuft dann höchstens einen
/// Block plus Filterlatenz vor dem Hörbaren.
pub(crate) struct Mixer {
    sample_rate: u32,
    channels: usize,
    rendered_frames: u64,
    sources: Vec<MixerSource>,
    ended_tx: mpsc::UnboundedSender<SourceId>,
    /// Leer wenn das Gerät mit der Rate der Zeitachse läuft
    resamplers: Vec<StreamResampler>,
    /// Interleaved, bereits auf Geräte-Rate, noch nicht abgespielt
    ready: VecDeque<f32>,
    block: Vec<f32>,
}

impl Mixer {
    pub(crate) fn new(
        sample_rate: u32,
        device_rate: u32,
        channels: usize,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Self {
        let channels = channels.max(1);
        let resamplers = if device_rate == sample_rate {
            Vec::new()
        } else {
            tracing::debug!("Resampling playback {} Hz -> {} Hz", sample_rate, device_rate);
            (0..channels)
                .map(|_| StreamResampler::new(sample_rate, device_rate))
                .collect()
        };

        Self {
            sample_rate,
            channels,
            rendered_frames: 0,
            sources: Vec::new(),
            ended_tx,
            resamplers,
            ready: VecDeque::new(),
            block: Vec::new(),
        }
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.rendered_frames as f64 / self.sample_rate as f64
    }

    /// Legt `buffer` auf die Zeitachse; gibt die tatsächliche Startzeit zurück
    ///
    /// Bereits gemischte Frames sind nicht mehr erreichbar, ein Start in der
    /// Vergangenheit rutscht daher auf den nächsten freien Frame.
    pub(crate) fn add(&mut self, id: SourceId, buffer: &AudioBuffer, when: f64) -> f64 {
        let rate = self.sample_rate as f64;
        let when = when.max(0.0);
        let requested = (when * rate).round() as u64;
        let start_frame = requested.max(self.rendered_frames);
        if start_frame > requested {
            tracing::debug!(
                "Source {} moved from frame {} to {}",
                id,
                requested,
                start_frame
            );
        }

        // Länge aus den gerundeten Grenzen, damit Nachbarn exakt anschließen
        let len = ((when + buffer.duration()) * rate).round() as u64 - requested;
        let channels = (0..buffer.channel_count())
            .filter_map(|c| buffer.channel_data(c))
            .map(|data| {
                if buffer.sample_rate() == self.sample_rate {
                    return data.to_vec();
                }
                let mut converted = resample_linear(data, buffer.sample_rate(), self.sample_rate);
                let pad = converted.last().copied().unwrap_or(0.0);
                converted.resize(len as usize, pad);
                converted
            })
            .collect();

        self.sources.push(MixerSource {
            id,
            start_frame,
            channels,
        });

        start_frame as f64 / rate
    }

    /// Entfernt eine Quelle; `false` wenn sie nicht (mehr) existiert
    pub(crate) fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    /// Füllt `out` (interleaved, Geräte-Rate)
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        if self.resamplers.is_empty() {
            self.mix(out);
            return;
        }

        while self.ready.len() < out.len() {
            let before = self.ready.len();
            self.mix_resampled_block();
            if self.ready.len() == before {
                // Resampler liefert nichts: Stille statt Endlosschleife
                break;
            }
        }

        for s in out.iter_mut() {
            *s = self.ready.pop_front().unwrap_or(0.0);
        }
    }

    /// Mischt einen Block der Zeitachse und reiht ihn auf Geräte-Rate ein
    fn mix_resampled_block(&mut self) {
        let channels = self.channels;
        let mut block = std::mem::take(&mut self.block);
        block.clear();
        block.resize(RESAMPLE_CHUNK * channels, 0.0);
        self.mix(&mut block);

        let converted: Vec<Vec<f32>> = self
            .resamplers
            .iter_mut()
            .enumerate()
            .map(|(c, resampler)| {
                let channel: Vec<f32> = block.iter().skip(c).step_by(channels).copied().collect();
                resampler.process(&channel)
            })
            .collect();

        let frames = converted.iter().map(Vec::len).min().unwrap_or(0);
        for i in 0..frames {
            for channel in &converted {
                self.ready.push_back(channel[i]);
            }
        }

        self.block = block;
    }

    /// Mischt `out` (interleaved, Rate der Zeitachse) und rückt die Uhr vor
    fn mix(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = (out.len() / self.channels) as u64;
        let window_start = self.rendered_frames;
        let window_end = window_start + frames;

        for source in &self.sources {
            let from = source.start_frame.max(window_start);
            let to = source.end_frame().min(window_end);
            if from >= to || source.channels.is_empty() {
                continue;
            }

            for frame in from..to {
                let src_idx = (frame - source.start_frame) as usize;
                let out_idx = (frame - window_start) as usize * self.channels;
                for c in 0..self.channels {
                    let data = &source.channels[c.min(source.channels.len() - 1)];
                    if let Some(s) = out.get_mut(out_idx + c) {
                        *s += data[src_idx];
                    }
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        self.rendered_frames = window_end;

        let ended_tx = &self.ended_tx;
        self.sources.retain(|source| {
            if source.end_frame() <= window_end {
                let _ = ended_tx.send(source.id);
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn active_sources(&self) -> usize {
        self.sources.len()
    }
}

// ============================================================================
// SPEAKER OUTPUT
// ============================================================================

/// Lautsprecher-Ausgabe über cpal
pub struct SpeakerOutput {
    mixer: Arc<Mutex<Mixer>>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerOutput {
    /// Öffnet das Ausgabegerät und startet die Zeitachse
    pub fn open(
        device: Device,
        target_sample_rate: u32,
        ended_tx: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Self, AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .collect();
        let config = crate::devices::select_best_config(configs, target_sample_rate)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(
            target_sample_rate,
            config.sample_rate.0,
            config.channels as usize,
            ended_tx,
        )));

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let callback_mixer = Arc::clone(&mixer);

        let thread = std::thread::Builder::new()
            .name("live-call-output".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback_mixer.lock().render(data);
                    },
                    |err| {
                        tracing::error!("Audio playback error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamBuildError(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamPlayError(e.to_string())));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Bis close() warten; danach wird der Stream gedroppt
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::DeviceThread(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| AudioError::DeviceThread(e.to_string()))??;

        Ok(Self {
            mixer,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl AudioOutput for SpeakerOutput {
    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn start_source(
        &mut self,
        id: SourceId,
        buffer: &AudioBuffer,
        when: f64,
    ) -> Result<f64, AudioError> {
        if self.stop_tx.is_none() {
            return Err(AudioError::Closed);
        }
        Ok(self.mixer.lock().add(id, buffer, when))
    }

    fn stop_source(&mut self, id: SourceId) -> Result<(), AudioError> {
        if !self.mixer.lock().remove(id) {
            tracing::trace!("Source {} already finished", id);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let stop_tx = self.stop_tx.take().ok_or(AudioError::Closed)?;
        let _ = stop_tx.send(());

        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::DeviceThread("output thread panicked".to_string()))?;
        }

        let dropped = {
            let mut mixer = self.mixer.lock();
            let n = mixer.active_sources();
            mixer.sources.clear();
            n
        };
        tracing::info!("Audio output closed ({} sources dropped)", dropped);
        Ok(())
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            let _ = self.close();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
