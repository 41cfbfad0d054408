//! facewatch-media — Camera capture, still encoding and recording.
//!
//! Provides V4L2-based camera access, RGB frame conversion, JPEG stills for
//! recognition, Motion-JPEG file reading and the recording controller.

pub mod camera;
pub mod frame;
pub mod mjpeg;
pub mod recorder;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
pub use frame::{load_photo, Frame, FrameError, StillImage};
pub use mjpeg::{count_frames, load_video_frame, split_frames};
pub use recorder::{
    negotiate_format, recording_file_name, ContainerFormat, FrameEncoder, MjpegEncoder,
    PendingRecording, RecordedFile, RecordingController, RecordingError, RecordingState,
};
