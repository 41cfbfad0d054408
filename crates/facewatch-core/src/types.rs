use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name the recognition service reports for a face with no match in the gallery.
pub const UNKNOWN_NAME: &str = "Unknown";

const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Face bounding box as fractions of the source image's intrinsic size.
///
/// `(x, y)` is the top-left corner. Values are expected in `[0, 1]` but the
/// service does not guarantee it; use [`clamped`](Self::clamped) before drawing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp the box into the unit square, shrinking it where it overflows.
    pub fn clamped(&self) -> Self {
        let x = unit(self.x);
        let y = unit(self.y);
        Self {
            x,
            y,
            width: unit(self.width).min(1.0 - x),
            height: unit(self.height).min(1.0 - y),
        }
    }
}

fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// One face returned by the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

impl DetectedFace {
    /// True when the service found no match in the reference gallery.
    pub fn is_unknown(&self) -> bool {
        self.name.trim().eq_ignore_ascii_case(UNKNOWN_NAME)
    }
}

/// Output of a single recognition call.
///
/// `person_count` comes from the service and is authoritative; it may differ
/// from `faces.len()` (occluded people are counted without a box).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
    #[serde(default)]
    pub person_count: u32,
}

/// Toggles that control which optional result fields the service fills in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionOptions {
    #[serde(default)]
    pub recognize_gender: bool,
    #[serde(default)]
    pub count_people: bool,
}

/// An image in its wire form: MIME type plus base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub mime: String,
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(mime: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime: mime.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self::from_bytes(DEFAULT_IMAGE_MIME, bytes)
    }

    /// Decode the base64 payload back into raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Intrinsic pixel size of a piece of media. Zero means "not known yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// A registered person with a single reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPerson {
    pub id: String,
    pub name: String,
    /// Base64-encoded reference image.
    pub image: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    #[serde(default)]
    pub created_at: String,
}

fn default_mime() -> String {
    DEFAULT_IMAGE_MIME.to_string()
}

impl KnownPerson {
    pub fn reference_image(&self) -> EncodedImage {
        EncodedImage {
            mime: self.mime.clone(),
            data: self.image.clone(),
        }
    }
}

/// Immutable roster snapshot handed to each recognition call.
pub type Gallery = Arc<[KnownPerson]>;
