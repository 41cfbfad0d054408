//! Frame type, pixel conversion and still capture.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::path::Path;

/// JPEG quality for stills submitted to the recognition service.
pub const STILL_JPEG_QUALITY: u8 = 85;

/// A captured RGB camera frame at the camera's native resolution.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

/// A JPEG-encoded still with its native pixel size.
#[derive(Debug, Clone)]
pub struct StillImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Whether the frame carries a complete image.
    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= rgb_len(self.width, self.height)
    }

    /// Encode the frame as a JPEG still at its native resolution.
    ///
    /// Returns `None` if the frame is incomplete or encoding fails; callers
    /// treat that as "try again later".
    pub fn still(&self) -> Option<StillImage> {
        if !self.is_ready() {
            return None;
        }
        let rgb = &self.data[..rgb_len(self.width, self.height)];
        match encode_jpeg(rgb, self.width, self.height, STILL_JPEG_QUALITY) {
            Ok(jpeg) => Some(StillImage {
                jpeg,
                width: self.width,
                height: self.height,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode still");
                None
            }
        }
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Encode packed RGB8 pixels as JPEG.
pub fn encode_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(out)
}

/// Convert packed YUYV (4:2:2) to RGB8 using full-range BT.601.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push(to_u8(y + 1.402 * v));
            rgb.push(to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(to_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB8.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].iter().flat_map(|&p| [p, p, p]).collect())
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Decode an uploaded photo and re-encode it as a JPEG still.
pub fn load_photo(path: &Path) -> Result<StillImage, FrameError> {
    let img =
        image::open(path).map_err(|e| FrameError::Decode(format!("{}: {e}", path.display())))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(FrameError::Decode(format!("{}: empty image", path.display())));
    }
    let jpeg = encode_jpeg(rgb.as_raw(), width, height, STILL_JPEG_QUALITY)?;
    Ok(StillImage {
        jpeg,
        width,
        height,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("failed to read {0}")]
    Io(#[from] std::io::Error),
    #[error("video has {available} frames; index {index} is out of range")]
    FrameOutOfRange { index: usize, available: usize },
}
