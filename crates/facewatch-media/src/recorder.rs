//! Recording of the live stream into a downloadable media file.
//!
//! The controller is a two-state machine (Stopped/Recording). While
//! recording, each pushed frame is encoded into a chunk; stopping hands the
//! chunks over as a [`PendingRecording`] that is assembled off the capture
//! path.

use crate::frame::{encode_jpeg, Frame};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Quality for Motion-JPEG recording chunks.
pub const RECORDING_JPEG_QUALITY: u8 = 80;

/// A container/codec pairing a recording can be written as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerFormat {
    pub mime: &'static str,
    pub extension: &'static str,
}

impl ContainerFormat {
    pub const WEBM_VP9: Self = Self {
        mime: "video/webm;codecs=vp9",
        extension: "webm",
    };
    pub const WEBM: Self = Self {
        mime: "video/webm",
        extension: "webm",
    };
    pub const MP4: Self = Self {
        mime: "video/mp4",
        extension: "mp4",
    };
    pub const MJPEG: Self = Self {
        mime: "video/x-motion-jpeg",
        extension: "mjpeg",
    };
}

/// Containers tried in order before falling back to [`ContainerFormat::MJPEG`].
pub const PREFERRED_FORMATS: [ContainerFormat; 3] = [
    ContainerFormat::WEBM_VP9,
    ContainerFormat::WEBM,
    ContainerFormat::MP4,
];

/// Pick the first preferred container the encoder supports, else Motion-JPEG.
pub fn negotiate_format(is_supported: impl Fn(&str) -> bool) -> ContainerFormat {
    PREFERRED_FORMATS
        .into_iter()
        .find(|format| is_supported(format.mime))
        .unwrap_or(ContainerFormat::MJPEG)
}

/// File name for a recording started at `started_at`.
pub fn recording_file_name(format: ContainerFormat, started_at: DateTime<Local>) -> String {
    format!(
        "facewatch-recording-{}.{}",
        started_at.format("%Y-%m-%dT%H-%M-%S"),
        format.extension
    )
}

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("no active camera stream to record")]
    NoStream,
    #[error("already recording")]
    AlreadyRecording,
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to write recording: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes frames into incrementally emitted chunks.
pub trait FrameEncoder {
    /// Whether the encoder can produce the given container mime type.
    fn supports(&self, mime: &str) -> bool;

    /// Encode one frame into a chunk of the output stream.
    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, RecordingError>;
}

/// Motion-JPEG encoder: one JPEG image per frame.
pub struct MjpegEncoder {
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl Default for MjpegEncoder {
    fn default() -> Self {
        Self::new(RECORDING_JPEG_QUALITY)
    }
}

impl FrameEncoder for MjpegEncoder {
    fn supports(&self, mime: &str) -> bool {
        mime == ContainerFormat::MJPEG.mime
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<u8>, RecordingError> {
        if !frame.is_ready() {
            return Err(RecordingError::Encode("incomplete frame".into()));
        }
        let len = frame.width as usize * frame.height as usize * 3;
        encode_jpeg(&frame.data[..len], frame.width, frame.height, self.quality)
            .map_err(|e| RecordingError::Encode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Stopped,
    Recording,
}

struct Session {
    format: ContainerFormat,
    started_at: DateTime<Local>,
    chunks: Vec<Vec<u8>>,
}

/// Drives a [`FrameEncoder`] through the Stopped/Recording lifecycle.
pub struct RecordingController<E> {
    encoder: E,
    session: Option<Session>,
}

impl<E: FrameEncoder> RecordingController<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            session: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        if self.session.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Stopped
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Stopped → Recording. Requires an active stream.
    pub fn start(
        &mut self,
        stream_active: bool,
        started_at: DateTime<Local>,
    ) -> Result<ContainerFormat, RecordingError> {
        if self.session.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }
        if !stream_active {
            return Err(RecordingError::NoStream);
        }
        let format = negotiate_format(|mime| self.encoder.supports(mime));
        tracing::info!(mime = format.mime, "recording started");
        self.session = Some(Session {
            format,
            started_at,
            chunks: Vec::new(),
        });
        Ok(format)
    }

    /// Encode a frame into the current recording. Ignored while stopped.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let chunk = self.encoder.encode(frame)?;
        session.chunks.push(chunk);
        Ok(())
    }

    /// Recording → Stopped. Returns the captured data, or `None` if not recording.
    pub fn stop(&mut self) -> Option<PendingRecording> {
        let session = self.session.take()?;
        tracing::info!(chunks = session.chunks.len(), "recording stopped");
        Some(PendingRecording {
            format: session.format,
            started_at: session.started_at,
            chunks: session.chunks,
        })
    }

    /// The stream went away mid-recording; stop and keep what was captured.
    pub fn stream_lost(&mut self) -> Option<PendingRecording> {
        if self.session.is_some() {
            tracing::warn!("camera stream lost while recording");
        }
        self.stop()
    }
}

/// Chunks of a stopped recording, not yet assembled into a file.
pub struct PendingRecording {
    format: ContainerFormat,
    started_at: DateTime<Local>,
    chunks: Vec<Vec<u8>>,
}

/// An assembled recording.
#[derive(Debug, Clone)]
pub struct RecordedFile {
    pub file_name: String,
    pub mime: &'static str,
    pub data: Vec<u8>,
}

impl PendingRecording {
    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn frame_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_name(&self) -> String {
        recording_file_name(self.format, self.started_at)
    }

    /// Concatenate chunks into one file.
    pub fn assemble(self) -> RecordedFile {
        let file_name = self.file_name();
        RecordedFile {
            file_name,
            mime: self.format.mime,
            data: self.chunks.concat(),
        }
    }

    /// Assemble and write into `dir`, returning the written path.
    pub fn write_to(self, dir: &Path) -> Result<PathBuf, RecordingError> {
        std::fs::create_dir_all(dir)?;
        let file = self.assemble();
        let path = dir.join(&file.file_name);
        std::fs::write(&path, &file.data)?;
        tracing::info!(path = %path.display(), bytes = file.data.len(), "recording saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mjpeg::split_frames;
    use chrono::TimeZone;

    fn test_frame(width: u32, height: u32) -> Frame {
        Frame {
            data: vec![128; (width * height * 3) as usize],
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 12, 5, 7).unwrap()
    }

    #[test]
    fn test_negotiation_prefers_in_order() {
        assert_eq!(negotiate_format(|_| true), ContainerFormat::WEBM_VP9);
        assert_eq!(
            negotiate_format(|m| m == "video/webm" || m == "video/mp4"),
            ContainerFormat::WEBM
        );
        assert_eq!(negotiate_format(|m| m == "video/mp4"), ContainerFormat::MP4);
    }

    #[test]
    fn test_negotiation_falls_back_to_mjpeg() {
        assert_eq!(negotiate_format(|_| false), ContainerFormat::MJPEG);
        let encoder = MjpegEncoder::default();
        assert_eq!(
            negotiate_format(|m| encoder.supports(m)),
            ContainerFormat::MJPEG
        );
    }

    #[test]
    fn test_file_name_has_timestamp_and_extension() {
        assert_eq!(
            recording_file_name(ContainerFormat::MJPEG, noon()),
            "facewatch-recording-2024-03-09T12-05-07.mjpeg"
        );
        assert_eq!(
            recording_file_name(ContainerFormat::WEBM_VP9, noon()),
            "facewatch-recording-2024-03-09T12-05-07.webm"
        );
    }

    #[test]
    fn test_start_requires_active_stream() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        assert!(matches!(
            controller.start(false, noon()),
            Err(RecordingError::NoStream)
        ));
        assert_eq!(controller.state(), RecordingState::Stopped);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        controller.start(true, noon()).unwrap();
        assert!(matches!(
            controller.start(true, noon()),
            Err(RecordingError::AlreadyRecording)
        ));
    }

    #[test]
    fn test_record_and_assemble() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        controller.push_frame(&test_frame(8, 8)).unwrap(); // ignored while stopped

        assert_eq!(controller.start(true, noon()).unwrap(), ContainerFormat::MJPEG);
        assert_eq!(controller.state(), RecordingState::Recording);
        for _ in 0..3 {
            controller.push_frame(&test_frame(8, 8)).unwrap();
        }

        let pending = controller.stop().unwrap();
        assert_eq!(controller.state(), RecordingState::Stopped);
        assert_eq!(pending.frame_count(), 3);

        let file = pending.assemble();
        assert_eq!(file.mime, "video/x-motion-jpeg");
        assert_eq!(file.file_name, "facewatch-recording-2024-03-09T12-05-07.mjpeg");
        assert_eq!(split_frames(&file.data).len(), 3);
    }

    #[test]
    fn test_stop_when_stopped_is_none() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        assert!(controller.stop().is_none());
        assert!(controller.stream_lost().is_none());
    }

    #[test]
    fn test_stream_lost_keeps_captured_frames() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        controller.start(true, noon()).unwrap();
        controller.push_frame(&test_frame(4, 4)).unwrap();
        let pending = controller.stream_lost().unwrap();
        assert_eq!(pending.frame_count(), 1);
        assert!(!controller.is_recording());
    }

    #[test]
    fn test_incomplete_frame_is_an_encode_error() {
        let mut controller = RecordingController::new(MjpegEncoder::default());
        controller.start(true, noon()).unwrap();
        let mut frame = test_frame(4, 4);
        frame.data.truncate(3);
        assert!(matches!(
            controller.push_frame(&frame),
            Err(RecordingError::Encode(_))
        ));
        assert!(controller.is_recording());
    }

    #[test]
    fn test_write_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = RecordingController::new(MjpegEncoder::default());
        controller.start(true, noon()).unwrap();
        controller.push_frame(&test_frame(4, 4)).unwrap();
        let path = controller
            .stop()
            .unwrap()
            .write_to(&dir.path().join("recordings"))
            .unwrap();
        assert!(path.ends_with("facewatch-recording-2024-03-09T12-05-07.mjpeg"));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
