//! Motion-JPEG files: a plain concatenation of JPEG images.
//!
//! This is the container the recorder writes, and the file-backed video
//! format frames can be analyzed from.

use crate::frame::{FrameError, StillImage};
use std::path::Path;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Split a Motion-JPEG stream into its JPEG frames.
///
/// Header segments are skipped by their length fields, so a thumbnail
/// embedded in an APPn segment stays inside its frame. After the first
/// scan header the next EOI marker ends the frame. Bytes between frames
/// are ignored.
pub fn split_frames(stream: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while let Some(start) = find(stream, pos, SOI) {
        let Some(end) = frame_end(stream, start) else {
            break;
        };
        frames.push(&stream[start..end + 2]);
        pos = end + 2;
    }
    frames
}

/// Offset of the EOI marker closing the frame that starts at `start`.
fn frame_end(stream: &[u8], start: usize) -> Option<usize> {
    let mut pos = start + 2;
    loop {
        let Some(&[0xFF, code]) = stream.get(pos..pos + 2) else {
            break;
        };
        match code {
            0xD9 => return Some(pos),
            // fill byte
            0xFF => pos += 1,
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let len = u16::from_be_bytes([*stream.get(pos + 2)?, *stream.get(pos + 3)?]);
                pos += 2 + usize::from(len);
                if code == 0xDA {
                    break;
                }
            }
        }
    }
    find(stream, pos, EOI)
}

fn find(haystack: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|i| from + i)
}

/// Extract frame `index` of a Motion-JPEG file as a still.
pub fn load_video_frame(path: &Path, index: usize) -> Result<StillImage, FrameError> {
    let stream = std::fs::read(path)?;
    let frames = split_frames(&stream);
    let jpeg = frames.get(index).ok_or(FrameError::FrameOutOfRange {
        index,
        available: frames.len(),
    })?;
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(format!("{} frame {index}: {e}", path.display())))?;
    Ok(StillImage {
        jpeg: jpeg.to_vec(),
        width: decoded.width(),
        height: decoded.height(),
    })
}

/// Number of frames in a Motion-JPEG file.
pub fn count_frames(path: &Path) -> Result<usize, FrameError> {
    Ok(split_frames(&std::fs::read(path)?).len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_jpeg;

    #[test]
    fn test_split_marker_pairs() {
        let stream = [
            0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, // frame 1 after junk
            0xFF, 0xD8, 0x03, 0xFF, 0xD9, // frame 2
            0xFF, 0xD8, 0x04, // truncated tail
        ];
        let frames = split_frames(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        assert_eq!(frames[1], &[0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
    }

    #[test]
    fn test_split_keeps_embedded_thumbnail_inside_frame() {
        let stream = [
            0xFF, 0xD8, // SOI
            0xFF, 0xE1, 0x00, 0x08, 0xFF, 0xD8, 0xAA, 0xFF, 0xD9, 0x00, // APP1 with thumbnail
            0xFF, 0xDA, 0x00, 0x03, 0x01, // SOS
            0x11, 0x22, // scan data
            0xFF, 0xD9, // EOI
        ];
        let frames = split_frames(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), stream.len());
    }

    #[test]
    fn test_split_empty() {
        assert!(split_frames(&[]).is_empty());
        assert!(split_frames(&[0xFF]).is_empty());
    }

    #[test]
    fn test_load_video_frame_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mjpeg");
        let mut stream = encode_jpeg(&[0u8; 8 * 6 * 3], 8, 6, 80).unwrap();
        stream.extend(encode_jpeg(&[255u8; 16 * 12 * 3], 16, 12, 80).unwrap());
        std::fs::write(&path, &stream).unwrap();

        assert_eq!(count_frames(&path).unwrap(), 2);
        let second = load_video_frame(&path, 1).unwrap();
        assert_eq!((second.width, second.height), (16, 12));
        assert!(matches!(
            load_video_frame(&path, 2),
            Err(FrameError::FrameOutOfRange { index: 2, available: 2 })
        ));
    }
}
