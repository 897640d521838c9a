use crate::error::StreamError;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::Arc;

/// Pre-canned minimal valid JPEG emitted as a keep-alive when the buffer is
/// momentarily empty. Viewers keep receiving bytes; the stream never hangs.
pub const KEEPALIVE_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x01, 0x00,
    0x48, 0x00, 0x48, 0x00, 0x00, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x08, 0x06, 0x06, 0x07, 0x06,
    0x05, 0x08, 0x07, 0x07, 0x07, 0x09, 0x09, 0x08, 0x0A, 0x0C, 0x14, 0x0D, 0x0C, 0x0B, 0x0B,
    0x0C, 0x19, 0x12, 0x13, 0x0F, 0x14, 0x1D, 0x1A, 0x1F, 0x1E, 0x1D, 0x1A, 0x1C, 0x1C, 0x20,
    0x24, 0x2E, 0x27, 0x20, 0x22, 0x2C, 0x23, 0x1C, 0x1C, 0x28, 0x37, 0x29, 0x2C, 0x30, 0x31,
    0x34, 0x34, 0x34, 0x1F, 0x27, 0x39, 0x3D, 0x38, 0x32, 0x3C, 0x2E, 0x33, 0x34, 0x32, 0xFF,
    0xC0, 0x00, 0x11, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, 0x01, 0x11, 0x00, 0x02, 0x11, 0x01,
    0x03, 0x11, 0x01, 0xFF, 0xC4, 0x00, 0x14, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xFF, 0xC4, 0x00, 0x14, 0x10,
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0xFF, 0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F,
    0x00, 0xAA, 0xFF, 0xD9,
];

/// Quality threshold above which the encoder's optimization parameters are
/// fully engaged (kept from the device-tuned original; the baseline encoder
/// expresses it through its quality tables).
pub const OPTIMIZED_ENCODE_THRESHOLD: u8 = 65;

/// Encode a frame to JPEG at the given quality on the blocking pool.
pub async fn encode_jpeg(
    pixels: Arc<RgbImage>,
    quality: u8,
) -> Result<Vec<u8>, StreamError> {
    let quality = quality.clamp(1, 100);
    tokio::task::spawn_blocking(move || {
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
        encoder
            .encode(
                pixels.as_raw(),
                pixels.width(),
                pixels.height(),
                image::ColorType::Rgb8,
            )
            .map_err(|e| StreamError::FrameEncoding {
                details: e.to_string(),
            })?;
        Ok(jpeg)
    })
    .await
    .map_err(|e| StreamError::FrameEncoding {
        details: format!("encode task panicked: {}", e),
    })?
}
