//! Frame ingestion: decoding raw camera buffers and grouping them into
//! synchronized frame sets.

use image::{DynamicImage, ImageBuffer, Luma};

pub mod sync;

pub use sync::{FrameError, FrameSyncBuffer, SyncConfig, SynchronizedFrameSet, TimedFrame};

/// Decoded camera frame.
pub type PixelBuffer = DynamicImage;

/// Single-channel intensity image in `[0, 1]`.
pub type GrayImageF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Frame buffer is empty")]
    Empty,
    #[error("Unsupported or corrupt image data: {0}")]
    Image(String),
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        DecodeError::Image(err.to_string())
    }
}

/// Turns the raw bytes delivered by a camera into a pixel buffer.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, DecodeError>;
}

/// Decodes any container format supported by the `image` crate (PNG, JPEG, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl FrameDecoder for ImageDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelBuffer, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(image::load_from_memory(bytes)?)
    }
}

pub fn to_intensity(buffer: &PixelBuffer) -> GrayImageF32 {
    buffer.to_luma32f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{encode_png, textured_image};

    #[test]
    fn test_image_decoder() {
        let png = encode_png(&textured_image(32, 24, 0.0, 1));
        let decoded = ImageDecoder.decode(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));

        let intensity = to_intensity(&decoded);
        assert!(intensity.pixels().all(|p| (0.0..=1.0).contains(&p[0])));

        assert!(matches!(ImageDecoder.decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(
            ImageDecoder.decode(&[0x13, 0x37, 0x00, 0x42]),
            Err(DecodeError::Image(_))
        ));
    }
}
