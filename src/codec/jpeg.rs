//! JPEG-Kompression für Kamera-Standbilder

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageCodecError {
    #[error("Frame size mismatch: {width}x{height} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Roher RGB8-Frame von der Kamera-Oberfläche
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Komprimiert einen Frame zu JPEG mit der angegebenen Qualität (1-100)
pub fn encode_jpeg(frame: RgbFrame, quality: u8) -> Result<Vec<u8>, ImageCodecError> {
    let RgbFrame {
        width,
        height,
        data,
    } = frame;
    let expected = width as usize * height as usize * 3;
    let actual = data.len();

    let img = RgbImage::from_raw(width, height, data).ok_or(ImageCodecError::SizeMismatch {
        width,
        height,
        expected,
        actual,
    })?;

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(img).write_with_encoder(encoder)?;
    Ok(buf)
}

/// JPEG + Base64 in einem Schritt (Payload für den Transport)
pub fn encode_jpeg_base64(frame: RgbFrame, quality: u8) -> Result<String, ImageCodecError> {
    encode_jpeg(frame, quality).map(|jpeg| BASE64.encode(jpeg))
}
