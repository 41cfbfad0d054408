//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture resolution. Drivers may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;

const STREAM_BUFFERS: u32 = 4;

/// How long a dequeue may block before it counts as a capture failure.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("camera unsupported: {0}")]
    Unsupported(String),
    #[error("camera unavailable: {0}")]
    Unknown(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

impl CameraError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => {
                "Camera access was denied. Check that your user can open the video device \
                 (usually membership in the `video` group)."
                    .to_string()
            }
            Self::Unsupported(detail) => {
                format!("This camera cannot be used for capture ({detail}).")
            }
            Self::Unknown(detail) => format!("Could not open the camera: {detail}"),
            Self::CaptureFailed(detail) => format!("Camera capture failed: {detail}"),
        }
    }

    /// Classify an error returned while opening a device.
    pub fn from_open_error(device_path: &str, err: &io::Error) -> Self {
        let detail = format!("{device_path}: {err}");
        match err.raw_os_error() {
            Some(libc::EACCES | libc::EPERM) => return Self::PermissionDenied(detail),
            Some(libc::ENOENT | libc::ENODEV | libc::ENXIO) => {
                return Self::Unsupported(format!("{device_path}: no such capture device"))
            }
            Some(libc::EBUSY) => {
                return Self::Unknown(format!("{device_path}: device is busy"))
            }
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(detail),
            io::ErrorKind::NotFound => {
                Self::Unsupported(format!("{device_path}: no such capture device"))
            }
            _ => Self::Unknown(detail),
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// Motion-JPEG, one compressed image per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// V4L2 camera device handle. Dropping it releases the device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let device = Device::with_path(device_path)
            .map_err(|e| CameraError::from_open_error(device_path, &e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::from_open_error(device_path, &e))?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::Unsupported(format!(
                "{device_path} is not a video capture device"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::Unknown(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::Unknown(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::Unsupported(format!(
                "unsupported pixel format {} (need YUYV, GREY or MJPG)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Start streaming. Frames are pulled with [`FrameStream::next_frame`].
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS).map_err(
                |e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")),
            )?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        let next = move || -> Result<Frame, CameraError> {
            let (buf, meta) = stream.next().map_err(dequeue_error)?;
            let sequence = meta.sequence;
            let data = self.buf_to_rgb(buf)?;
            Ok(Frame {
                data,
                width: self.width,
                height: self.height,
                timestamp: std::time::Instant::now(),
                sequence,
            })
        };
        Ok(FrameStream {
            next: Box::new(next),
        })
    }

    /// Convert a raw buffer to RGB8 based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height),
            PixelFormat::Mjpeg => {
                image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                    .map(|img| img.to_rgb8().into_raw())
                    .map_err(|e| frame::FrameError::Decode(e.to_string()))
            }
        };
        converted.map_err(|e| {
            CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format))
        })
    }
}

fn dequeue_error(err: io::Error) -> CameraError {
    if err.kind() == io::ErrorKind::TimedOut {
        CameraError::CaptureFailed(format!("no frame within {DEQUEUE_TIMEOUT:?}"))
    } else {
        CameraError::CaptureFailed(format!("failed to dequeue buffer: {err}"))
    }
}

/// An active capture stream borrowed from a [`Camera`]. Dropping it stops
/// streaming.
pub struct FrameStream<'a> {
    next: Box<dyn FnMut() -> Result<Frame, CameraError> + 'a>,
}

impl FrameStream<'_> {
    /// Dequeue the next frame, converted to RGB8.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        (self.next)()
    }
}
