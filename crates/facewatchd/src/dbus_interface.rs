use crate::session::{Session, SessionError};
use facewatch_core::RemoteRecognizer;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the facewatch daemon.
///
/// Bus name: org.facewatch.FaceWatch1
/// Object path: /org/facewatch/FaceWatch1
///
/// Structured results are returned as JSON strings.
pub struct FaceWatchService {
    session: Arc<Session<RemoteRecognizer>>,
}

impl FaceWatchService {
    pub fn new(session: Arc<Session<RemoteRecognizer>>) -> Self {
        Self { session }
    }
}

fn failed(e: SessionError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.user_message())
}

fn json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn path_reply(path: Option<PathBuf>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

#[interface(name = "org.facewatch.FaceWatch1")]
impl FaceWatchService {
    /// List registered people (without reference images).
    async fn list_people(&self) -> zbus::fdo::Result<String> {
        json(&self.session.list_people())
    }

    /// Register a person from a photo file.
    async fn add_person(&self, name: &str, photo_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, photo_path, "add_person requested");
        let person = self
            .session
            .add_person(name, PathBuf::from(photo_path).as_path())
            .await
            .map_err(failed)?;
        json(&person)
    }

    async fn remove_person(&self, id: &str) -> zbus::fdo::Result<bool> {
        self.session.remove_person(id).map_err(failed)
    }

    async fn get_options(&self) -> zbus::fdo::Result<String> {
        json(&self.session.options())
    }

    async fn set_options(
        &self,
        recognize_gender: bool,
        count_people: bool,
    ) -> zbus::fdo::Result<String> {
        let options = self
            .session
            .set_options(Some(recognize_gender), Some(count_people))
            .map_err(failed)?;
        json(&options)
    }

    /// Analyze a photo file.
    async fn analyze_image(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "analyze_image requested");
        let analysis = self
            .session
            .analyze_image(PathBuf::from(path).as_path())
            .await
            .map_err(failed)?;
        json(&analysis)
    }

    /// Analyze one frame of a Motion-JPEG video file.
    async fn analyze_video_frame(&self, path: &str, index: u32) -> zbus::fdo::Result<String> {
        tracing::info!(path, index, "analyze_video_frame requested");
        let analysis = self
            .session
            .analyze_video_frame(PathBuf::from(path).as_path(), index as usize)
            .await
            .map_err(failed)?;
        json(&analysis)
    }

    /// Queue photos for batch analysis. Returns the new item ids.
    async fn batch_add(&self, paths: Vec<String>) -> zbus::fdo::Result<String> {
        let ids = self
            .session
            .batch_add(paths.into_iter().map(PathBuf::from).collect())
            .await
            .map_err(failed)?;
        json(&ids)
    }

    /// Start a batch run in the background. Returns the number submitted.
    async fn batch_run(&self) -> zbus::fdo::Result<u32> {
        let submitted = self.session.batch_run().map_err(failed)?;
        Ok(u32::try_from(submitted).unwrap_or(u32::MAX))
    }

    async fn batch_list(&self) -> zbus::fdo::Result<String> {
        json(&self.session.batch_list())
    }

    async fn batch_select(&self, id: &str) -> zbus::fdo::Result<String> {
        let item = self.session.batch_select(id).map_err(failed)?;
        json(&item)
    }

    async fn batch_clear(&self) -> zbus::fdo::Result<()> {
        self.session.batch_clear().map_err(failed)
    }

    async fn start_camera(&self) -> zbus::fdo::Result<String> {
        let info = self.session.start_camera().await.map_err(failed)?;
        json(&info)
    }

    /// Release the camera. Returns the path of a recording saved on the way, or "".
    async fn stop_camera(&self) -> zbus::fdo::Result<String> {
        let saved = self.session.stop_camera().await.map_err(failed)?;
        Ok(path_reply(saved))
    }

    async fn start_analysis(&self) -> zbus::fdo::Result<bool> {
        self.session.start_analysis().await.map_err(failed)
    }

    async fn stop_analysis(&self) -> zbus::fdo::Result<bool> {
        Ok(self.session.stop_analysis())
    }

    /// Latest live analysis state and result.
    async fn live_result(&self) -> zbus::fdo::Result<String> {
        json(&self.session.live_result())
    }

    /// Start recording. Returns the negotiated container mime type.
    async fn start_recording(&self) -> zbus::fdo::Result<String> {
        let format = self.session.start_recording().await.map_err(failed)?;
        Ok(format.mime.to_string())
    }

    /// Stop recording. Returns the saved file path, or "" if nothing was recording.
    async fn stop_recording(&self) -> zbus::fdo::Result<String> {
        let saved = self.session.stop_recording().await.map_err(failed)?;
        Ok(path_reply(saved))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        json(&self.session.status())
    }
}
