//! Overlay geometry. Fits media into a display box and maps fractional
//! face boxes onto it.
//!
//! The media is letterboxed: scaled uniformly to fit entirely inside the
//! display box, never cropped. Face boxes from the recognition service are
//! fractions of the media's intrinsic size, so they map onto the scaled
//! media independent of its resolution.

use crate::types::{BoundingBox, DetectedFace, Size};
use serde::Serialize;

/// Pixel rectangle relative to the top-left of the scaled media.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PixelRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// A face ready to be drawn over the displayed media.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceOverlay {
    pub rect: PixelRect,
    pub label: String,
    /// False for faces the service could not match against the gallery.
    pub matched: bool,
    pub confidence_pct: u32,
}

/// Scale state for one displayed media element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    client_width: f32,
    client_height: f32,
    natural: Size,
    scale: f32,
}

impl Viewport {
    /// Fit media of `natural` size into a `client_width × client_height` box.
    pub fn fit(client_width: f32, client_height: f32, natural: Size) -> Self {
        let mut viewport = Self {
            client_width,
            client_height,
            natural,
            scale: 1.0,
        };
        viewport.recompute();
        viewport
    }

    /// Recompute after the display box changed size.
    pub fn resize(&mut self, client_width: f32, client_height: f32) {
        self.client_width = client_width;
        self.client_height = client_height;
        self.recompute();
    }

    /// Recompute once the media's intrinsic size becomes known.
    pub fn with_natural_size(mut self, natural: Size) -> Self {
        self.natural = natural;
        self.recompute();
        self
    }

    fn recompute(&mut self) {
        self.scale = if self.natural.is_known() {
            let sx = self.client_width / self.natural.width as f32;
            let sy = self.client_height / self.natural.height as f32;
            sx.min(sy).max(0.0)
        } else {
            1.0
        };
    }

    /// Overlays can only be placed once the intrinsic size is known.
    pub fn is_ready(&self) -> bool {
        self.natural.is_known()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn scaled_width(&self) -> f32 {
        self.natural.width as f32 * self.scale
    }

    pub fn scaled_height(&self) -> f32 {
        self.natural.height as f32 * self.scale
    }

    /// Offset of the scaled media inside the display box when centered.
    pub fn letterbox_offset(&self) -> (f32, f32) {
        (
            ((self.client_width - self.scaled_width()) / 2.0).max(0.0),
            ((self.client_height - self.scaled_height()) / 2.0).max(0.0),
        )
    }

    /// Map a fractional box to pixels on the scaled media.
    pub fn map_box(&self, bbox: &BoundingBox) -> PixelRect {
        let b = bbox.clamped();
        let w = self.scaled_width();
        let h = self.scaled_height();
        PixelRect {
            left: b.x * w,
            top: b.y * h,
            width: b.width * w,
            height: b.height * h,
        }
    }

    /// Build overlays for a result. Empty until the viewport is ready.
    pub fn overlays(&self, faces: &[DetectedFace], show_gender: bool) -> Vec<FaceOverlay> {
        if !self.is_ready() {
            return Vec::new();
        }
        faces
            .iter()
            .map(|face| {
                let confidence_pct = (face.confidence.clamp(0.0, 1.0) * 100.0).round() as u32;
                FaceOverlay {
                    rect: self.map_box(&face.bbox),
                    label: overlay_label(face, show_gender, confidence_pct),
                    matched: !face.is_unknown(),
                    confidence_pct,
                }
            })
            .collect()
    }
}

/// `name`, then gender when shown, then confidence: "Alice (female) 93%".
fn overlay_label(face: &DetectedFace, show_gender: bool, confidence_pct: u32) -> String {
    match (&face.gender, show_gender) {
        (Some(gender), true) if !gender.is_empty() => {
            format!("{} ({gender}) {confidence_pct}%", face.name)
        }
        _ => format!("{} {confidence_pct}%", face.name),
    }
}
