use chrono::Local;
use facewatch_core::{EncodedImage, FrameSource, Size, Still};
use facewatch_media::{
    Camera, CameraError, ContainerFormat, Frame, FrameStream, MjpegEncoder, PendingRecording,
    RecordingController, RecordingError, StillImage,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Consecutive capture failures after which the stream counts as lost.
const MAX_CAPTURE_FAILURES: u32 = 5;

/// Upper bound on waiting for the engine thread to answer a request.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("recording error: {0}")]
    Recording(#[from] RecordingError),
    #[error("camera is not started")]
    CameraNotOpen,
    #[error("no camera frame available yet")]
    FrameNotReady,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("recording writer failed: {0}")]
    Writer(String),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("camera did not respond within {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Camera(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

/// A capture device the engine can stream from.
pub trait VideoDevice: Sized {
    fn open(path: &str) -> Result<Self, CameraError>;
    fn size(&self) -> (u32, u32);
    /// Stream frames into `f` until it returns.
    fn with_stream<R>(&self, f: impl FnOnce(&mut dyn FrameFeed) -> R) -> Result<R, CameraError>;
}

/// Blocking source of frames from an active stream.
pub trait FrameFeed {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

impl FrameFeed for FrameStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        FrameStream::next_frame(self)
    }
}

impl VideoDevice for Camera {
    fn open(path: &str) -> Result<Self, CameraError> {
        Camera::open(path)
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn with_stream<R>(&self, f: impl FnOnce(&mut dyn FrameFeed) -> R) -> Result<R, CameraError> {
        let mut stream = self.stream()?;
        Ok(f(&mut stream))
    }
}

/// Camera properties reported once streaming starts.
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

/// Settings the engine thread runs with.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub camera_device: String,
    pub recordings_dir: PathBuf,
    pub recording_frame_interval: Duration,
    pub reply_timeout: Duration,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    OpenCamera {
        reply: oneshot::Sender<Result<CameraInfo, EngineError>>,
    },
    CloseCamera {
        reply: oneshot::Sender<Option<PendingRecording>>,
    },
    Capture {
        reply: oneshot::Sender<Result<StillImage, EngineError>>,
    },
    StartRecording {
        reply: oneshot::Sender<Result<ContainerFormat, EngineError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Option<PendingRecording>>,
    },
}

#[derive(Default)]
struct EngineStatus {
    live: AtomicBool,
    recording: AtomicBool,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: Arc<EngineStatus>,
    recordings_dir: Arc<PathBuf>,
    reply_timeout: Duration,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed),
            Err(_) => {
                tracing::warn!(timeout = ?self.reply_timeout, "engine request timed out");
                Err(EngineError::Timeout(self.reply_timeout))
            }
        }
    }

    /// Open the camera and start streaming. Idempotent.
    pub async fn open_camera(&self) -> Result<CameraInfo, EngineError> {
        self.request(|reply| EngineRequest::OpenCamera { reply }).await?
    }

    /// Release the camera. A recording in progress is stopped and saved.
    pub async fn close_camera(&self) -> Result<Option<PathBuf>, EngineError> {
        let pending = self.request(|reply| EngineRequest::CloseCamera { reply }).await?;
        self.save(pending).await
    }

    /// Encode the most recent frame as a still at native resolution.
    pub async fn capture(&self) -> Result<StillImage, EngineError> {
        self.request(|reply| EngineRequest::Capture { reply }).await?
    }

    pub async fn start_recording(&self) -> Result<ContainerFormat, EngineError> {
        self.request(|reply| EngineRequest::StartRecording { reply })
            .await?
    }

    /// Stop recording and write the file. `None` if nothing was recording.
    pub async fn stop_recording(&self) -> Result<Option<PathBuf>, EngineError> {
        let pending = self
            .request(|reply| EngineRequest::StopRecording { reply })
            .await?;
        self.save(pending).await
    }

    pub fn is_live(&self) -> bool {
        self.status.live.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.status.recording.load(Ordering::SeqCst)
    }

    async fn save(
        &self,
        pending: Option<PendingRecording>,
    ) -> Result<Option<PathBuf>, EngineError> {
        let Some(pending) = pending else {
            return Ok(None);
        };
        let dir = Arc::clone(&self.recordings_dir);
        let path = tokio::task::spawn_blocking(move || pending.write_to(&dir))
            .await
            .map_err(|e| EngineError::Writer(e.to_string()))??;
        Ok(Some(path))
    }
}

impl FrameSource for EngineHandle {
    fn is_live(&self) -> bool {
        EngineHandle::is_live(self)
    }

    async fn capture(&self) -> Option<Still> {
        match EngineHandle::capture(self).await {
            Ok(still) => Some(Still {
                image: EncodedImage::jpeg(&still.jpeg),
                size: Size::new(still.width, still.height),
            }),
            Err(e) => {
                tracing::debug!(error = %e, "live capture skipped");
                None
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera is opened on request, not at startup; while it is open the
/// thread pumps frames continuously so captures always see a fresh frame.
pub fn spawn_engine<D: VideoDevice + 'static>(
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let status = Arc::new(EngineStatus::default());
    let recordings_dir = Arc::new(settings.recordings_dir.clone());
    let reply_timeout = settings.reply_timeout;

    let thread_status = Arc::clone(&status);
    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            Engine::<D>::new(settings, rx, thread_status).run();
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        status,
        recordings_dir,
        reply_timeout,
    })
}

/// How a streaming session ended.
enum StreamExit {
    Closed(oneshot::Sender<Option<PendingRecording>>),
    Lost,
    Shutdown,
}

struct Engine<D> {
    settings: EngineSettings,
    rx: mpsc::Receiver<EngineRequest>,
    status: Arc<EngineStatus>,
    recorder: RecordingController<MjpegEncoder>,
    _device: std::marker::PhantomData<fn() -> D>,
}

impl<D: VideoDevice> Engine<D> {
    fn new(
        settings: EngineSettings,
        rx: mpsc::Receiver<EngineRequest>,
        status: Arc<EngineStatus>,
    ) -> Self {
        Self {
            settings,
            rx,
            status,
            recorder: RecordingController::new(MjpegEncoder::default()),
            _device: std::marker::PhantomData,
        }
    }

    /// Request loop while the camera is closed.
    fn run(&mut self) {
        while let Some(req) = self.rx.blocking_recv() {
            match req {
                EngineRequest::OpenCamera { reply } => {
                    if self.open_and_stream(reply) {
                        return;
                    }
                }
                EngineRequest::CloseCamera { reply } => {
                    let _ = reply.send(None);
                }
                EngineRequest::Capture { reply } => {
                    let _ = reply.send(Err(EngineError::CameraNotOpen));
                }
                EngineRequest::StartRecording { reply } => {
                    let _ = reply.send(self.start_recording(false));
                }
                EngineRequest::StopRecording { reply } => {
                    let _ = reply.send(self.stop_recording());
                }
            }
        }
    }

    /// Open the device and pump frames until closed. Returns true on shutdown.
    fn open_and_stream(
        &mut self,
        reply: oneshot::Sender<Result<CameraInfo, EngineError>>,
    ) -> bool {
        let device = match D::open(&self.settings.camera_device) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(
                    device = %self.settings.camera_device,
                    error = %e,
                    "camera open failed"
                );
                let _ = reply.send(Err(e.into()));
                return false;
            }
        };
        let (width, height) = device.size();
        let info = CameraInfo {
            device: self.settings.camera_device.clone(),
            width,
            height,
        };

        let mut reply = Some(reply);
        let streamed = device.with_stream(|feed| {
            self.status.live.store(true, Ordering::SeqCst);
            if let Some(reply) = reply.take() {
                let _ = reply.send(Ok(info));
            }
            let exit = self.pump(feed);
            self.status.live.store(false, Ordering::SeqCst);
            exit
        });

        match streamed {
            Err(e) => {
                tracing::warn!(error = %e, "failed to start camera stream");
                if let Some(reply) = reply.take() {
                    let _ = reply.send(Err(e.into()));
                }
                false
            }
            Ok(StreamExit::Closed(reply)) => {
                let pending = self.stop_recording();
                let _ = reply.send(pending);
                tracing::info!("camera released");
                false
            }
            Ok(StreamExit::Lost) => {
                if let Some(pending) = self.recorder.stream_lost() {
                    self.status.recording.store(false, Ordering::SeqCst);
                    if let Err(e) = pending.write_to(&self.settings.recordings_dir) {
                        tracing::warn!(error = %e, "failed to save interrupted recording");
                    }
                }
                false
            }
            Ok(StreamExit::Shutdown) => {
                if let Some(pending) = self.stop_recording() {
                    if let Err(e) = pending.write_to(&self.settings.recordings_dir) {
                        tracing::warn!(error = %e, "failed to save recording at shutdown");
                    }
                }
                true
            }
        }
    }

    /// Pull frames, feed the recorder and serve requests between frames.
    fn pump(&mut self, feed: &mut dyn FrameFeed) -> StreamExit {
        let mut latest: Option<Frame> = None;
        let mut last_recorded: Option<Instant> = None;
        let mut failures = 0u32;

        loop {
            match feed.next_frame() {
                Ok(frame) => {
                    failures = 0;
                    let interval = self.settings.recording_frame_interval;
                    let due = last_recorded.map_or(true, |at| at.elapsed() >= interval);
                    if self.recorder.is_recording() && due {
                        if let Err(e) = self.recorder.push_frame(&frame) {
                            tracing::debug!(error = %e, "dropped recording frame");
                        }
                        last_recorded = Some(Instant::now());
                    }
                    latest = Some(frame);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "frame capture failed");
                    if failures >= MAX_CAPTURE_FAILURES {
                        tracing::error!("camera stream lost");
                        return StreamExit::Lost;
                    }
                }
            }

            loop {
                let req = match self.rx.try_recv() {
                    Ok(req) => req,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return StreamExit::Shutdown,
                };
                match req {
                    EngineRequest::OpenCamera { reply } => {
                        let (width, height) = latest
                            .as_ref()
                            .map_or((0, 0), |f| (f.width, f.height));
                        let _ = reply.send(Ok(CameraInfo {
                            device: self.settings.camera_device.clone(),
                            width,
                            height,
                        }));
                    }
                    EngineRequest::CloseCamera { reply } => return StreamExit::Closed(reply),
                    EngineRequest::Capture { reply } => {
                        let still = latest
                            .as_ref()
                            .and_then(Frame::still)
                            .ok_or(EngineError::FrameNotReady);
                        let _ = reply.send(still);
                    }
                    EngineRequest::StartRecording { reply } => {
                        last_recorded = None;
                        let _ = reply.send(self.start_recording(true));
                    }
                    EngineRequest::StopRecording { reply } => {
                        let _ = reply.send(self.stop_recording());
                    }
                }
            }
        }
    }

    fn start_recording(&mut self, stream_active: bool) -> Result<ContainerFormat, EngineError> {
        let format = self.recorder.start(stream_active, Local::now())?;
        self.status.recording.store(true, Ordering::SeqCst);
        Ok(format)
    }

    fn stop_recording(&mut self) -> Option<PendingRecording> {
        self.status.recording.store(false, Ordering::SeqCst);
        self.recorder.stop()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory device producing solid grey frames. `/dev/flaky` streams
    /// a few frames and then fails, `/dev/frozen` streams a few frames and
    /// then blocks for good, and `/dev/denied` cannot be opened.
    pub(crate) struct FakeDevice {
        fail_after: Option<u32>,
        freeze_after: Option<u32>,
    }

    struct FakeFeed {
        produced: u32,
        fail_after: Option<u32>,
        freeze_after: Option<u32>,
    }

    impl FrameFeed for FakeFeed {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            self.produced += 1;
            if self.freeze_after.is_some_and(|n| self.produced > n) {
                std::thread::sleep(Duration::from_secs(3600));
            }
            if self.fail_after.is_some_and(|n| self.produced > n) {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            Ok(Frame {
                data: vec![90; 32 * 24 * 3],
                width: 32,
                height: 24,
                timestamp: Instant::now(),
                sequence: self.produced,
            })
        }
    }

    impl VideoDevice for FakeDevice {
        fn open(path: &str) -> Result<Self, CameraError> {
            match path {
                "/dev/denied" => Err(CameraError::PermissionDenied(path.to_string())),
                "/dev/flaky" => Ok(FakeDevice {
                    fail_after: Some(3),
                    freeze_after: None,
                }),
                "/dev/frozen" => Ok(FakeDevice {
                    fail_after: None,
                    freeze_after: Some(3),
                }),
                _ => Ok(FakeDevice {
                    fail_after: None,
                    freeze_after: None,
                }),
            }
        }

        fn size(&self) -> (u32, u32) {
            (32, 24)
        }

        fn with_stream<R>(
            &self,
            f: impl FnOnce(&mut dyn FrameFeed) -> R,
        ) -> Result<R, CameraError> {
            Ok(f(&mut FakeFeed {
                produced: 0,
                fail_after: self.fail_after,
                freeze_after: self.freeze_after,
            }))
        }
    }

    pub(crate) fn fake_engine(device: &str, recordings_dir: PathBuf) -> EngineHandle {
        fake_engine_with_timeout(device, recordings_dir, DEFAULT_REPLY_TIMEOUT)
    }

    pub(crate) fn fake_engine_with_timeout(
        device: &str,
        recordings_dir: PathBuf,
        reply_timeout: Duration,
    ) -> EngineHandle {
        spawn_engine::<FakeDevice>(EngineSettings {
            camera_device: device.to_string(),
            recordings_dir,
            recording_frame_interval: Duration::ZERO,
            reply_timeout,
        })
        .unwrap()
    }
}
