//! PCM Framing - Float-Samples <-> 16-bit PCM <-> Base64
//!
//! Das Transportformat zum Agenten ist rohes, little-endian 16-bit PCM
//! (mono), eingebettet als Base64 in JSON-Nachrichten.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bytes pro Sample (i16)
const BYTES_PER_SAMPLE: usize = 2;

/// Skalierung beim Encoden (f32 -> i16)
const ENCODE_SCALE: f32 = 32767.0;

/// Skalierung beim Decoden (i16 -> f32)
const DECODE_SCALE: f32 = 32768.0;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(String),

    #[error("PCM payload of {len} bytes is not a multiple of {frame_bytes} bytes")]
    Misaligned { len: usize, frame_bytes: usize },

    #[error("Channel count must be at least 1")]
    NoChannels,
}

// ============================================================================
// AUDIO BUFFER
// ============================================================================

/// Dekodierter, abspielbarer Audio-Puffer (planar, ein Vec pro Kanal)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Erstellt einen Mono-Puffer
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Anzahl Frames (Samples pro Kanal)
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Daten eines Kanals
    pub fn channel_data(&self, channel: usize) -> Option<&[f32]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    /// Dauer in Sekunden
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

// ============================================================================
// ENCODE / DECODE
// ============================================================================

/// Wandelt Float-Samples in Base64-kodiertes 16-bit LE PCM um
pub fn encode(samples: &[f32]) -> String {
    BASE64.encode(to_pcm16_bytes(samples))
}

/// Float-Samples -> i16 little-endian Bytes
pub fn to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * ENCODE_SCALE).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Base64-Text -> rohe Bytes
pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Interpretiert Bytes als interleaved 16-bit LE PCM und baut daraus
/// einen abspielbaren Puffer
pub fn decode_audio_data(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: u16,
) -> Result<AudioBuffer, DecodeError> {
    if channel_count == 0 {
        return Err(DecodeError::NoChannels);
    }

    let channel_count = channel_count as usize;
    let frame_bytes = BYTES_PER_SAMPLE * channel_count;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (i, chunk) in bytes.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
        let value = i16::from_le_bytes([chunk[0], chunk[1]]);
        channels[i % channel_count].push(value as f32 / DECODE_SCALE);
    }

    Ok(AudioBuffer {
        channels,
        sample_rate,
    })
}

// ============================================================================
// MEDIA CHUNKS
// ============================================================================

/// Ein Medien-Payload für `realtimeInput.mediaChunks`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    /// Audio-Frame (PCM @ `sample_rate`)
    pub fn audio(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={}", sample_rate),
            data: encode(samples),
        }
    }

    /// Bereits Base64-kodiertes JPEG
    pub fn jpeg(data: String) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            data,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

// ============================================================================
// TESTS
// ============================================================================
