//! Daemon control layer: owns the roster, settings and analysis surfaces and
//! enforces that recording and live analysis never run together.

use crate::engine::{CameraInfo, EngineError, EngineHandle};
use facewatch_core::recognizer::recognize_with_timeout;
use facewatch_core::{
    BatchError, BatchItem, BatchPipeline, EncodedImage, Gallery, KnownPerson, LiveAnalysisLoop,
    LiveSnapshot, LoopState, LoopTiming, RecognitionClient, RecognitionError,
    RecognitionOptions, RecognitionRequest, RecognitionResult, RosterError, RosterManager,
    Settings, Size, SqliteStore, StoreError,
};
use facewatch_media::{ContainerFormat, FrameError, StillImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("failed to save settings: {0}")]
    Store(#[from] StoreError),
    #[error("recognition failed: {0}")]
    Recognition(#[from] RecognitionError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("live analysis cannot start while recording")]
    RecordingActive,
    #[error("background task failed: {0}")]
    Task(String),
}

impl SessionError {
    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Engine(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

/// A roster entry without its reference image.
#[derive(Debug, Clone, Serialize)]
pub struct PersonSummary {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

impl From<&KnownPerson> for PersonSummary {
    fn from(person: &KnownPerson) -> Self {
        Self {
            id: person.id.clone(),
            name: person.name.clone(),
            created_at: person.created_at.clone(),
        }
    }
}

/// Result of a single-shot analysis, with the size boxes are relative to.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub size: Size,
    pub result: RecognitionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveView {
    pub state: LoopState,
    #[serde(flatten)]
    pub snapshot: LiveSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchView {
    pub running: bool,
    pub selected: Option<String>,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub version: &'static str,
    pub camera_live: bool,
    pub analysis: LoopState,
    pub recording: bool,
    pub batch_running: bool,
    pub people: usize,
    pub options: RecognitionOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Session<C> {
    client: Arc<C>,
    engine: EngineHandle,
    roster: Mutex<RosterManager<SqliteStore>>,
    settings: Mutex<Settings<SqliteStore>>,
    live: LiveAnalysisLoop<C, EngineHandle>,
    batch: Arc<BatchPipeline<C>>,
    request_timeout: Duration,
    /// Serializes camera, live analysis and recording transitions.
    stream_control: tokio::sync::Mutex<()>,
}

impl<C: RecognitionClient> Session<C> {
    pub fn new(
        client: Arc<C>,
        engine: EngineHandle,
        roster_store: SqliteStore,
        settings_store: SqliteStore,
        timing: LoopTiming,
        batch_workers: usize,
    ) -> Self {
        let roster = RosterManager::open(roster_store);
        let settings = Settings::open(settings_store);
        let live = LiveAnalysisLoop::new(
            Arc::clone(&client),
            Arc::new(engine.clone()),
            roster.subscribe(),
            settings.subscribe(),
            timing,
        );
        let batch = BatchPipeline::new(Arc::clone(&client))
            .with_workers(batch_workers)
            .with_request_timeout(timing.request_timeout);
        Self {
            client,
            engine,
            roster: Mutex::new(roster),
            settings: Mutex::new(settings),
            live,
            batch: Arc::new(batch),
            request_timeout: timing.request_timeout,
            stream_control: tokio::sync::Mutex::new(()),
        }
    }

    fn gallery(&self) -> Gallery {
        lock(&self.roster).list()
    }

    pub fn options(&self) -> RecognitionOptions {
        lock(&self.settings).get()
    }

    // Roster

    pub fn list_people(&self) -> Vec<PersonSummary> {
        self.gallery().iter().map(PersonSummary::from).collect()
    }

    /// Register a person from a photo on disk.
    pub async fn add_person(
        &self,
        name: &str,
        photo: &Path,
    ) -> Result<PersonSummary, SessionError> {
        let still = load_blocking(photo.to_path_buf(), |p| facewatch_media::load_photo(&p)).await?;
        let person = lock(&self.roster).add(name, EncodedImage::jpeg(&still.jpeg))?;
        Ok(PersonSummary::from(&person))
    }

    pub fn remove_person(&self, id: &str) -> Result<bool, SessionError> {
        let removed = lock(&self.roster).remove(id)?;
        tracing::info!(id, removed, "person removal requested");
        Ok(removed)
    }

    // Options

    /// Update the given options, leaving the others as they are.
    pub fn set_options(
        &self,
        recognize_gender: Option<bool>,
        count_people: Option<bool>,
    ) -> Result<RecognitionOptions, SessionError> {
        let mut settings = lock(&self.settings);
        let mut options = settings.get();
        if let Some(value) = recognize_gender {
            options.recognize_gender = value;
        }
        if let Some(value) = count_people {
            options.count_people = value;
        }
        settings.set(options)?;
        Ok(options)
    }

    // Single-shot analysis

    pub async fn analyze_image(&self, photo: &Path) -> Result<Analysis, SessionError> {
        let still = load_blocking(photo.to_path_buf(), |p| facewatch_media::load_photo(&p)).await?;
        self.analyze_still(still).await
    }

    pub async fn analyze_video_frame(
        &self,
        video: &Path,
        index: usize,
    ) -> Result<Analysis, SessionError> {
        let still = load_blocking(video.to_path_buf(), move |p| {
            facewatch_media::load_video_frame(&p, index)
        })
        .await?;
        self.analyze_still(still).await
    }

    async fn analyze_still(&self, still: StillImage) -> Result<Analysis, SessionError> {
        let size = Size::new(still.width, still.height);
        let request = RecognitionRequest {
            image: EncodedImage::jpeg(&still.jpeg),
            gallery: self.gallery(),
            options: self.options(),
        };
        let result = recognize_with_timeout(&*self.client, request, self.request_timeout).await?;
        tracing::info!(
            faces = result.faces.len(),
            person_count = result.person_count,
            "image analyzed"
        );
        Ok(Analysis { size, result })
    }

    // Batch

    /// Load photos and queue them. Nothing is queued if any photo fails to load.
    pub async fn batch_add(&self, photos: Vec<PathBuf>) -> Result<Vec<String>, SessionError> {
        let mut loaded = Vec::with_capacity(photos.len());
        for photo in photos {
            let label = photo
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| photo.display().to_string());
            let still = load_blocking(photo, |p| facewatch_media::load_photo(&p)).await?;
            loaded.push((label, still));
        }
        Ok(loaded
            .into_iter()
            .map(|(label, still)| {
                self.batch.add(
                    label,
                    EncodedImage::jpeg(&still.jpeg),
                    Size::new(still.width, still.height),
                )
            })
            .collect())
    }

    /// Start a run in the background. Returns the number of items submitted.
    pub fn batch_run(&self) -> Result<usize, SessionError> {
        if self.batch.is_running() {
            return Err(BatchError::AlreadyRunning.into());
        }
        let submitted = self
            .batch
            .items()
            .iter()
            .filter(|item| item.status.is_submittable())
            .count();
        let batch = Arc::clone(&self.batch);
        let gallery = self.gallery();
        let options = self.options();
        tokio::spawn(async move {
            match batch.run(gallery, options).await {
                Ok(summary) => tracing::info!(
                    submitted = summary.submitted,
                    done = summary.done,
                    failed = summary.failed,
                    "batch run finished"
                ),
                Err(e) => tracing::warn!(error = %e, "batch run rejected"),
            }
        });
        Ok(submitted)
    }

    pub fn batch_list(&self) -> BatchView {
        BatchView {
            running: self.batch.is_running(),
            selected: self.batch.selected().map(|item| item.id),
            items: self.batch.items(),
        }
    }

    pub fn batch_select(&self, id: &str) -> Result<BatchItem, SessionError> {
        Ok(self.batch.select(id)?)
    }

    pub fn batch_clear(&self) -> Result<(), SessionError> {
        if self.batch.is_running() {
            return Err(BatchError::AlreadyRunning.into());
        }
        self.batch.clear();
        Ok(())
    }

    // Camera, live analysis and recording

    pub async fn start_camera(&self) -> Result<CameraInfo, SessionError> {
        Ok(self.engine.open_camera().await?)
    }

    /// Release the camera. Live analysis is stopped; a recording is saved.
    pub async fn stop_camera(&self) -> Result<Option<PathBuf>, SessionError> {
        let _control = self.stream_control.lock().await;
        self.live.stop();
        Ok(self.engine.close_camera().await?)
    }

    pub async fn start_analysis(&self) -> Result<bool, SessionError> {
        let _control = self.stream_control.lock().await;
        if self.engine.is_recording() {
            return Err(SessionError::RecordingActive);
        }
        if !self.engine.is_live() {
            return Err(EngineError::CameraNotOpen.into());
        }
        Ok(self.live.start())
    }

    pub fn stop_analysis(&self) -> bool {
        self.live.stop()
    }

    pub fn live_result(&self) -> LiveView {
        LiveView {
            state: self.live.state(),
            snapshot: self.live.snapshot(),
        }
    }

    /// Start recording; an armed live loop is stopped first.
    pub async fn start_recording(&self) -> Result<ContainerFormat, SessionError> {
        let _control = self.stream_control.lock().await;
        if self.live.stop() {
            tracing::info!("live analysis stopped for recording");
        }
        Ok(self.engine.start_recording().await?)
    }

    pub async fn stop_recording(&self) -> Result<Option<PathBuf>, SessionError> {
        let _control = self.stream_control.lock().await;
        Ok(self.engine.stop_recording().await?)
    }

    pub fn status(&self) -> StatusView {
        StatusView {
            version: env!("CARGO_PKG_VERSION"),
            camera_live: self.engine.is_live(),
            analysis: self.live.state(),
            recording: self.engine.is_recording(),
            batch_running: self.batch.is_running(),
            people: self.gallery().len(),
            options: self.options(),
        }
    }
}

/// Decode image files off the async runtime.
async fn load_blocking(
    path: PathBuf,
    load: impl FnOnce(PathBuf) -> Result<StillImage, FrameError> + Send + 'static,
) -> Result<StillImage, SessionError> {
    tokio::task::spawn_blocking(move || load(path))
        .await
        .map_err(|e| SessionError::Task(e.to_string()))?
        .map_err(SessionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::fake_engine;
    use facewatch_core::{BatchStatus, BoundingBox, DetectedFace};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRecognizer {
        calls: AtomicUsize,
    }

    impl RecognitionClient for StubRecognizer {
        async fn recognize(
            &self,
            request: RecognitionRequest,
        ) -> Result<RecognitionResult, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = request
                .gallery
                .first()
                .map_or_else(|| "Unknown".to_string(), |p| p.name.clone());
            Ok(RecognitionResult {
                faces: vec![DetectedFace {
                    bbox: BoundingBox::new(0.1, 0.1, 0.5, 0.5),
                    name,
                    gender: request.options.recognize_gender.then(|| "female".to_string()),
                    confidence: 0.8,
                }],
                person_count: 1,
            })
        }
    }

    struct Fixture {
        session: Session<StubRecognizer>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_engine("/dev/video0", dir.path().join("recordings"));
        let session = Session::new(
            Arc::new(StubRecognizer {
                calls: AtomicUsize::new(0),
            }),
            engine,
            SqliteStore::open_in_memory().unwrap(),
            SqliteStore::open_in_memory().unwrap(),
            LoopTiming {
                period: Duration::from_millis(20),
                request_timeout: Duration::from_secs(5),
            },
            3,
        );
        Fixture { session, dir }
    }

    fn write_photo(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        let rgb = vec![200u8; (width * height * 3) as usize];
        let jpeg = facewatch_media::frame::encode_jpeg(&rgb, width, height, 80).unwrap();
        std::fs::write(&path, jpeg).unwrap();
        path
    }

    #[tokio::test]
    async fn test_add_list_remove_person() {
        let f = fixture();
        let photo = write_photo(f.dir.path(), "alice.jpg", 40, 30);
        let person = f.session.add_person("Alice", &photo).await.unwrap();
        let people = f.session.list_people();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name, "Alice");
        assert!(f.session.remove_person(&person.id).unwrap());
        assert!(f.session.list_people().is_empty());
    }

    #[tokio::test]
    async fn test_add_person_with_unreadable_photo() {
        let f = fixture();
        let missing = f.dir.path().join("missing.jpg");
        assert!(matches!(
            f.session.add_person("Bob", &missing).await,
            Err(SessionError::Frame(_))
        ));
        assert!(f.session.list_people().is_empty());
    }

    #[tokio::test]
    async fn test_analyze_image_uses_roster_and_options() {
        let f = fixture();
        let photo = write_photo(f.dir.path(), "alice.jpg", 40, 30);
        f.session.add_person("Alice", &photo).await.unwrap();
        f.session.set_options(Some(true), None).unwrap();

        let analysis = f.session.analyze_image(&photo).await.unwrap();
        assert_eq!(analysis.size, Size::new(40, 30));
        assert_eq!(analysis.result.faces[0].name, "Alice");
        assert_eq!(analysis.result.faces[0].gender.as_deref(), Some("female"));
        assert!(!f.session.options().count_people);
    }

    #[tokio::test]
    async fn test_analyze_video_frame_out_of_range() {
        let f = fixture();
        let clip = write_photo(f.dir.path(), "clip.mjpeg", 16, 16);
        let analysis = f.session.analyze_video_frame(&clip, 0).await.unwrap();
        assert_eq!(analysis.size, Size::new(16, 16));
        assert!(matches!(
            f.session.analyze_video_frame(&clip, 3).await,
            Err(SessionError::Frame(FrameError::FrameOutOfRange { .. }))
        ));
    }

    #[tokio::test]
    async fn test_batch_run_completes_in_background() {
        let f = fixture();
        let photos = (0..4)
            .map(|i| write_photo(f.dir.path(), &format!("p{i}.jpg"), 20, 20))
            .collect();
        let ids = f.session.batch_add(photos).await.unwrap();
        assert_eq!(ids.len(), 4);

        assert_eq!(f.session.batch_run().unwrap(), 4);
        for _ in 0..100 {
            if !f.session.batch_list().running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let view = f.session.batch_list();
        assert!(!view.running);
        assert!(view.items.iter().all(|item| item.status == BatchStatus::Done));
        assert_eq!(f.session.batch_run().unwrap(), 0);

        let picked = f.session.batch_select(&ids[2]).unwrap();
        assert_eq!(picked.label, "p2.jpg");
        assert_eq!(f.session.batch_list().selected.as_deref(), Some(ids[2].as_str()));
    }

    #[tokio::test]
    async fn test_analysis_requires_camera() {
        let f = fixture();
        assert!(matches!(
            f.session.start_analysis().await,
            Err(SessionError::Engine(EngineError::CameraNotOpen))
        ));
    }

    #[tokio::test]
    async fn test_recording_and_analysis_are_exclusive() {
        let f = fixture();
        f.session.start_camera().await.unwrap();

        assert!(f.session.start_analysis().await.unwrap());
        assert_eq!(f.session.live_result().state, LoopState::Armed);

        // Recording disarms the loop.
        f.session.start_recording().await.unwrap();
        assert_eq!(f.session.live_result().state, LoopState::Idle);
        assert!(matches!(
            f.session.start_analysis().await,
            Err(SessionError::RecordingActive)
        ));

        let saved = f.session.stop_recording().await.unwrap();
        assert!(saved.is_some());
        assert!(f.session.start_analysis().await.unwrap());

        f.session.stop_camera().await.unwrap();
        let status = f.session.status();
        assert!(!status.camera_live);
        assert_eq!(status.analysis, LoopState::Idle);
    }

    #[tokio::test]
    async fn test_analysis_requested_during_recording_start_is_refused() {
        let f = fixture();
        f.session.start_camera().await.unwrap();

        // The recording start is still waiting on the engine when analysis
        // is requested.
        let (recording, analysis) =
            tokio::join!(f.session.start_recording(), f.session.start_analysis());
        assert!(recording.is_ok());
        assert!(matches!(analysis, Err(SessionError::RecordingActive)));

        let status = f.session.status();
        assert!(status.recording);
        assert_eq!(status.analysis, LoopState::Idle);
        f.session.stop_camera().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_analysis_delivers_results() {
        let f = fixture();
        f.session.start_camera().await.unwrap();
        f.session.start_analysis().await.unwrap();

        let mut updates = f.session.live.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                updates.changed().await.unwrap();
                if !updates.borrow().faces.is_empty() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let view = f.session.live_result();
        assert_eq!(view.snapshot.person_count, 1);
        assert!(view.snapshot.frame_size.is_some());

        assert!(f.session.stop_analysis());
        assert!(f.session.live_result().snapshot.faces.is_empty());
        f.session.stop_camera().await.unwrap();
    }
}
