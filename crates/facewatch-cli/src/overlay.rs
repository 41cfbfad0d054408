//! Rendering of recognition results: text overlays and annotated images.

use anyhow::{bail, Context, Result};
use facewatch_core::{FaceOverlay, RecognitionResult, Size, Viewport};
use image::{imageops, Rgb, RgbImage};
use serde::Deserialize;

const MATCHED: Rgb<u8> = Rgb([0, 200, 80]);
const UNKNOWN: Rgb<u8> = Rgb([220, 40, 40]);
const OUTLINE: u32 = 2;

/// A single-shot analysis as returned by the daemon.
#[derive(Debug, Deserialize)]
pub struct Analysis {
    pub size: Size,
    pub result: RecognitionResult,
}

/// Parse a display box given as `WIDTHxHEIGHT`.
pub fn parse_display(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .with_context(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let width: u32 = w.trim().parse().with_context(|| format!("bad width in {s:?}"))?;
    let height: u32 = h.trim().parse().with_context(|| format!("bad height in {s:?}"))?;
    if width == 0 || height == 0 {
        bail!("display box must be non-empty");
    }
    Ok((width, height))
}

/// Fit the analysed media into `display`, or show it at native size.
pub fn viewport(size: Size, display: Option<(u32, u32)>) -> Viewport {
    let (w, h) = display.unwrap_or((size.width, size.height));
    Viewport::fit(w as f32, h as f32, size)
}

/// One line per face, positioned in display-box pixels.
pub fn describe(
    analysis: &Analysis,
    display: Option<(u32, u32)>,
    show_gender: bool,
) -> Vec<String> {
    let view = viewport(analysis.size, display);
    let (dx, dy) = view.letterbox_offset();
    view.overlays(&analysis.result.faces, show_gender)
        .iter()
        .map(|o| {
            format!(
                "{:<28} at ({:.0}, {:.0}) size {:.0}x{:.0}{}",
                o.label,
                o.rect.left + dx,
                o.rect.top + dy,
                o.rect.width,
                o.rect.height,
                if o.matched { "" } else { "  [unmatched]" }
            )
        })
        .collect()
}

/// Render the media letterboxed into the display box with face outlines.
pub fn annotate(
    media: &RgbImage,
    result: &RecognitionResult,
    display: Option<(u32, u32)>,
    show_gender: bool,
) -> RgbImage {
    let size = Size::new(media.width(), media.height());
    let view = viewport(size, display);
    let (canvas_w, canvas_h) = display.unwrap_or((size.width, size.height));
    let mut canvas = RgbImage::new(canvas_w, canvas_h);

    let scaled_w = view.scaled_width().round().max(1.0) as u32;
    let scaled_h = view.scaled_height().round().max(1.0) as u32;
    let scaled = if (scaled_w, scaled_h) == (size.width, size.height) {
        media.clone()
    } else {
        imageops::resize(media, scaled_w, scaled_h, imageops::FilterType::Triangle)
    };
    let (dx, dy) = view.letterbox_offset();
    imageops::overlay(&mut canvas, &scaled, dx.round() as i64, dy.round() as i64);

    for overlay in view.overlays(&result.faces, show_gender) {
        draw_outline(&mut canvas, &overlay, dx, dy);
    }
    canvas
}

fn draw_outline(canvas: &mut RgbImage, overlay: &FaceOverlay, dx: f32, dy: f32) {
    let color = if overlay.matched { MATCHED } else { UNKNOWN };
    let (cw, ch) = canvas.dimensions();
    if cw == 0 || ch == 0 {
        return;
    }
    let left = (overlay.rect.left + dx).round().max(0.0) as u32;
    let top = (overlay.rect.top + dy).round().max(0.0) as u32;
    let right = ((overlay.rect.left + overlay.rect.width + dx).round() as u32).min(cw - 1);
    let bottom = ((overlay.rect.top + overlay.rect.height + dy).round() as u32).min(ch - 1);
    if left > right || top > bottom {
        return;
    }

    for t in 0..OUTLINE {
        for x in left..=right {
            for y in [top + t, bottom.saturating_sub(t)] {
                if y < ch {
                    canvas.put_pixel(x, y, color);
                }
            }
        }
        for y in top..=bottom {
            for x in [left + t, right.saturating_sub(t)] {
                if x < cw {
                    canvas.put_pixel(x, y, color);
                }
            }
        }
    }
}
