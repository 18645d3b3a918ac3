//! Mikrofon-Capture
//!
//! Der cpal-Callback schiebt Samples in einen [`FrameSink`], der sie auf
//! Mono/16 kHz bringt und in feste Fenster schneidet. Gemutete Fenster
//! werden verworfen, die Aufnahme selbst läuft weiter.

use super::{CaptureError, CaptureEvent, MuteSwitch};
use crate::codec::{downmix_to_mono, StreamResampler};
use crate::playback::AudioError;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Device;
use ringbuf::{traits::*, HeapRb};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

// ============================================================================
// AUDIO INPUT TRAIT
// ============================================================================

/// Ein geöffnetes Eingabegerät
///
/// `open` fordert den Zugriff an, `start` lässt Frames fließen, `stop`
/// gibt das Gerät frei. `stop` muss mehrfach aufrufbar sein.
pub trait AudioInput: Send {
    fn start(&mut self) -> Result<(), CaptureError>;
    fn stop(&mut self);
}

// ============================================================================
// FRAME SINK
// ============================================================================

/// Schneidet den Eingabestrom in Fenster fester Größe
pub struct FrameSink {
    buffer: HeapRb<f32>,
    frame_size: usize,
    input_channels: usize,
    target_rate: u32,
    /// Lebt so lange wie der Stream, nicht nur einen Callback
    resampler: StreamResampler,
    muted: MuteSwitch,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl FrameSink {
    pub(crate) fn new(
        frame_size: usize,
        target_rate: u32,
        muted: MuteSwitch,
        events_tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            buffer: HeapRb::new(frame_size * 4),
            frame_size,
            input_channels: 1,
            target_rate,
            resampler: StreamResampler::new(target_rate, target_rate),
            muted,
            events_tx,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Format des Geräts, das tatsächlich geöffnet wurde
    pub fn set_input_format(&mut self, sample_rate: u32, channels: usize) {
        self.input_channels = channels.max(1);
        self.resampler = StreamResampler::new(sample_rate, self.target_rate);
        if !self.resampler.is_passthrough() {
            tracing::debug!(
                "Resampling microphone {} Hz -> {} Hz",
                sample_rate,
                self.target_rate
            );
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Nimmt interleaved Samples im Geräteformat entgegen
    pub fn push_interleaved(&mut self, data: &[f32]) {
        let mono = downmix_to_mono(data, self.input_channels);
        let samples = self.resampler.process(&mono);

        for sample in samples {
            if self.buffer.try_push(sample).is_err() {
                // Kann nur passieren, wenn ein Callback mehr als drei Fenster liefert
                self.flush_frames();
                let _ = self.buffer.try_push(sample);
            }
        }
        self.flush_frames();
    }

    fn flush_frames(&mut self) {
        while self.buffer.occupied_len() >= self.frame_size {
            let frame: Vec<f32> = (0..self.frame_size)
                .filter_map(|_| self.buffer.try_pop())
                .collect();

            if self.muted.is_muted() {
                self.frames_dropped += 1;
                continue;
            }

            if self.events_tx.send(CaptureEvent::Audio(frame)).is_ok() {
                self.frames_sent += 1;
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

// ============================================================================
// MICROPHONE (cpal)
// ============================================================================

enum MicCommand {
    Start(std::sync::mpsc::SyncSender<Result<(), AudioError>>),
    Stop,
}

/// Mikrofon über cpal; der Stream lebt auf einem eigenen Thread
pub struct MicrophoneCapture {
    command_tx: Option<std::sync::mpsc::Sender<MicCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneCapture {
    /// Fordert das Gerät an und baut den Stream (noch pausiert)
    pub fn open(
        device: Device,
        mut sink: FrameSink,
        target_sample_rate: u32,
    ) -> Result<Self, CaptureError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .collect();
        // Ohne F32-Format kann der Callback nicht gebaut werden
        let config = crate::devices::select_best_config(configs, target_sample_rate)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        tracing::info!(
            "Opening audio capture: {} Hz, {} channels (frames of {} @ {} Hz)",
            config.sample_rate.0,
            config.channels,
            sink.frame_size(),
            target_sample_rate
        );
        sink.set_input_format(config.sample_rate.0, config.channels as usize);

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), CaptureError>>(1);
        let (command_tx, command_rx) = std::sync::mpsc::channel::<MicCommand>();

        let thread = std::thread::Builder::new()
            .name("live-call-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        sink.push_interleaved(data);
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CaptureError::from(e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while let Ok(command) = command_rx.recv() {
                    match command {
                        MicCommand::Start(reply) => {
                            let result = stream
                                .play()
                                .map_err(|e| AudioError::StreamPlayError(e.to_string()));
                            let _ = reply.send(result);
                        }
                        MicCommand::Stop => break,
                    }
                }

                drop(stream);
                tracing::info!("Audio capture stream released");
            })
            .map_err(|e| CaptureError::Audio(AudioError::DeviceThread(e.to_string())))?;

        ready_rx
            .recv()
            .map_err(|e| CaptureError::Audio(AudioError::DeviceThread(e.to_string())))??;

        Ok(Self {
            command_tx: Some(command_tx),
            thread: Some(thread),
        })
    }
}

impl AudioInput for MicrophoneCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(CaptureError::Audio(AudioError::Closed))?;

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        command_tx
            .send(MicCommand::Start(reply_tx))
            .map_err(|e| CaptureError::Audio(AudioError::DeviceThread(e.to_string())))?;
        reply_rx
            .recv()
            .map_err(|e| CaptureError::Audio(AudioError::DeviceThread(e.to_string())))??;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(command_tx) = self.command_tx.take() {
            let _ = command_tx.send(MicCommand::Stop);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Audio capture thread panicked");
            }
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
