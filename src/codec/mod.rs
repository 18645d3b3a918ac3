//! Codec Module - Wire-Formate für Audio und Video
//!
//! - PCM Framing (f32 <-> 16-bit LE PCM <-> Base64)
//! - JPEG-Kompression der Kamera-Frames
//! - Stream-Resampling (rubato) auf die Wire-Sample-Rates

pub mod jpeg;
pub mod pcm;
pub mod resample;

pub use jpeg::{encode_jpeg_base64, ImageCodecError, RgbFrame};
pub use pcm::{decode, decode_audio_data, encode, AudioBuffer, DecodeError, MediaChunk};
pub use resample::{downmix_to_mono, resample_linear, StreamResampler};
