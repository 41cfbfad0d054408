//! In-process fakes for the recognition service and the live frame source.

use crate::live::{FrameSource, Still};
use crate::recognizer::{RecognitionClient, RecognitionError, RecognitionRequest};
use crate::types::{BoundingBox, DetectedFace, EncodedImage, RecognitionResult, Size};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn alice_result() -> RecognitionResult {
    RecognitionResult {
        faces: vec![DetectedFace {
            bbox: BoundingBox::new(0.25, 0.1, 0.3, 0.4),
            name: "Alice".into(),
            gender: None,
            confidence: 0.9,
        }],
        person_count: 1,
    }
}

pub(crate) struct FakeRecognizer {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail_all: AtomicBool,
    pub fail_images: Mutex<HashSet<String>>,
    pub seen: Mutex<Vec<String>>,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_all: AtomicBool::new(false),
            fail_images: Mutex::new(HashSet::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_image(&self, image: &EncodedImage) {
        self.fail_images.lock().unwrap().insert(image.data.clone());
    }

    pub fn heal(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.fail_images.lock().unwrap().clear();
    }
}

impl RecognitionClient for FakeRecognizer {
    async fn recognize(
        &self,
        request: RecognitionRequest,
    ) -> Result<RecognitionResult, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.image.data.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = self.fail_all.load(Ordering::SeqCst)
            || self.fail_images.lock().unwrap().contains(&request.image.data);
        if fail {
            Err(RecognitionError::Transport("fake failure".into()))
        } else {
            Ok(alice_result())
        }
    }
}

pub(crate) struct FakeSource {
    pub live: AtomicBool,
    pub ready: AtomicBool,
    pub captures: AtomicUsize,
    pub capture_delay: Mutex<Duration>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(true),
            captures: AtomicUsize::new(0),
            capture_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FrameSource for FakeSource {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn capture(&self) -> Option<Still> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let delay = *self.capture_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.ready.load(Ordering::SeqCst) {
            return None;
        }
        Some(Still {
            image: EncodedImage::jpeg(&[0xFF, 0xD8, 0xFF, 0xD9]),
            size: Size::new(640, 480),
        })
    }
}
