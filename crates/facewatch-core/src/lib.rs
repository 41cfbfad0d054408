//! facewatch-core — the orchestration core of the facewatch front end.
//!
//! Face detection and identity matching are delegated to an external
//! recognition service. This crate owns everything around that call: the
//! roster of known people, recognition options, the live analysis loop,
//! the batch pipeline, and the geometry that maps returned face boxes onto
//! displayed media.

pub mod batch;
pub mod geometry;
pub mod live;
pub mod recognizer;
pub mod roster;
pub mod settings;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use batch::{BatchError, BatchItem, BatchPipeline, BatchStatus, BatchSummary};
pub use geometry::{FaceOverlay, PixelRect, Viewport};
pub use live::{FrameSource, LiveAnalysisLoop, LiveSnapshot, LoopState, LoopTiming, Still};
pub use recognizer::{RecognitionClient, RecognitionError, RecognitionRequest, RemoteRecognizer};
pub use roster::{RosterError, RosterManager};
pub use settings::Settings;
pub use store::{SqliteStore, StoreError};
pub use types::{
    BoundingBox, DetectedFace, EncodedImage, Gallery, KnownPerson, RecognitionOptions,
    RecognitionResult, Size,
};
