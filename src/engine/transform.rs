//! Image transform shared by the rotate and crash engines.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageResult};

/// Decode an image, rotate it 270 degrees clockwise and re-encode it as JPEG.
pub(crate) fn rotate_to_jpeg(payload: &[u8], quality: u8) -> ImageResult<Vec<u8>> {
    let decoded = image::load_from_memory(payload)?;
    let rotated = decoded.rotate270().to_rgb8();

    let mut out = Vec::with_capacity(payload.len());
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        rotated.as_raw(),
        rotated.width(),
        rotated.height(),
        ColorType::Rgb8,
    )?;
    Ok(out)
}
