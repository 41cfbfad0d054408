//! Live analysis loop. Periodic recognition of frames from a live source.
//!
//! States: Idle → Armed → (Capturing → AwaitingResult → Armed)* → Idle.
//!
//! A tick fires once per period. At most one recognition call is in flight:
//! a tick that finds the previous call unresolved is skipped, not queued.
//! Stopping bumps an epoch counter; a call that resolves under an older
//! epoch has its result dropped on delivery. The network call itself is
//! never aborted.

use crate::recognizer::{
    recognize_with_timeout, RecognitionClient, RecognitionRequest, DEFAULT_REQUEST_TIMEOUT,
};
use crate::types::{DetectedFace, EncodedImage, Gallery, RecognitionOptions, Size};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Period between ticks when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// A still frame captured from a live source, ready for submission.
#[derive(Debug, Clone)]
pub struct Still {
    pub image: EncodedImage,
    /// Native pixel size of the captured frame.
    pub size: Size,
}

/// A live media source the loop can sample.
pub trait FrameSource: Send + Sync + 'static {
    /// False when the source is paused, has ended, or is absent.
    fn is_live(&self) -> bool;

    /// Snapshot the current frame. `None` means "not ready, try next tick".
    fn capture(&self) -> impl Future<Output = Option<Still>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Idle,
    Armed,
    Capturing,
    AwaitingResult,
}

/// What the loop currently shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub faces: Vec<DetectedFace>,
    pub person_count: u32,
    /// Native size of the frame the faces were detected in.
    pub frame_size: Option<Size>,
    /// Most recent recognition failure, cleared by the next success.
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Timing knobs for the loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub period: Duration,
    pub request_timeout: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            period: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched,
    /// The previous call has not resolved.
    Busy,
    /// The source is paused, ended or absent.
    SourceUnavailable,
    /// The loop was stopped.
    Stale,
}

struct Shared<C, F> {
    client: Arc<C>,
    source: Arc<F>,
    gallery: watch::Receiver<Gallery>,
    options: watch::Receiver<RecognitionOptions>,
    timing: LoopTiming,
    armed: AtomicBool,
    epoch: AtomicU64,
    in_flight: Arc<AtomicBool>,
    /// Guards `state` and serializes every snapshot publication with `stop`.
    state: Mutex<LoopState>,
    snapshot: watch::Sender<LiveSnapshot>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag when the call's task finishes, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LiveAnalysisLoop<C, F> {
    shared: Arc<Shared<C, F>>,
}

impl<C: RecognitionClient, F: FrameSource> LiveAnalysisLoop<C, F> {
    pub fn new(
        client: Arc<C>,
        source: Arc<F>,
        gallery: watch::Receiver<Gallery>,
        options: watch::Receiver<RecognitionOptions>,
        timing: LoopTiming,
    ) -> Self {
        let (snapshot, _) = watch::channel(LiveSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                client,
                source,
                gallery,
                options,
                timing,
                armed: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                in_flight: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(LoopState::Idle),
                snapshot,
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Arm the loop. The first tick fires one period from now.
    ///
    /// Returns false if the loop was already armed. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> bool {
        let shared = &self.shared;
        if shared.armed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&shared.state) = LoopState::Armed;

        let task_shared = Arc::clone(shared);
        let handle = tokio::spawn(async move {
            let period = task_shared.timing.period;
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if Shared::tick(&task_shared, epoch) == TickOutcome::Stale {
                    break;
                }
            }
        });
        if let Some(previous) = lock(&shared.ticker).replace(handle) {
            previous.abort();
        }

        tracing::info!(
            epoch,
            period_ms = shared.timing.period.as_millis() as u64,
            "live analysis started"
        );
        true
    }

    /// Disarm the loop and clear what it displays.
    ///
    /// An in-flight call is left to finish; its result is discarded.
    /// Returns false if the loop was not armed.
    pub fn stop(&self) -> bool {
        let shared = &self.shared;
        let was_armed = shared.armed.swap(false, Ordering::SeqCst);
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(ticker) = lock(&shared.ticker).take() {
            ticker.abort();
        }
        {
            let mut state = lock(&shared.state);
            *state = LoopState::Idle;
            shared.snapshot.send_replace(LiveSnapshot::default());
        }
        if was_armed {
            tracing::info!("live analysis stopped");
        }
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        *lock(&self.shared.state)
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveSnapshot> {
        self.shared.snapshot.subscribe()
    }
}

impl<C: RecognitionClient, F: FrameSource> Shared<C, F> {
    fn is_current(&self, epoch: u64) -> bool {
        self.armed.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Run `apply` under the state lock, only if `epoch` is still current.
    fn if_current(&self, epoch: u64, apply: impl FnOnce(&mut LoopState)) -> bool {
        let mut state = lock(&self.state);
        if !self.is_current(epoch) {
            return false;
        }
        apply(&mut state);
        true
    }

    fn tick(self: &Arc<Self>, epoch: u64) -> TickOutcome {
        if !self.is_current(epoch) {
            return TickOutcome::Stale;
        }
        if !self.source.is_live() {
            tracing::trace!("live source unavailable; skipping tick");
            return TickOutcome::SourceUnavailable;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous recognition still in flight; skipping tick");
            return TickOutcome::Busy;
        }

        let guard = InFlight(Arc::clone(&self.in_flight));
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            shared.run_tick(epoch).await;
        });
        TickOutcome::Dispatched
    }

    async fn run_tick(&self, epoch: u64) {
        if !self.if_current(epoch, |s| *s = LoopState::Capturing) {
            return;
        }

        let captured = time::timeout(self.timing.request_timeout, self.source.capture()).await;
        let still = match captured {
            Ok(Some(still)) => still,
            Ok(None) => {
                tracing::debug!("frame not ready; retrying next tick");
                self.if_current(epoch, |s| *s = LoopState::Armed);
                return;
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.timing.request_timeout,
                    "frame capture timed out; retrying next tick"
                );
                self.if_current(epoch, |s| *s = LoopState::Armed);
                return;
            }
        };

        let request = RecognitionRequest {
            image: still.image,
            gallery: self.gallery.borrow().clone(),
            options: *self.options.borrow(),
        };
        if !self.if_current(epoch, |s| *s = LoopState::AwaitingResult) {
            return;
        }

        let limit = self.timing.request_timeout;
        let outcome = recognize_with_timeout(self.client.as_ref(), request, limit).await;

        let applied = self.if_current(epoch, |s| {
            *s = LoopState::Armed;
            self.snapshot.send_modify(|snap| match outcome {
                Ok(result) => {
                    tracing::debug!(
                        faces = result.faces.len(),
                        person_count = result.person_count,
                        "live recognition result"
                    );
                    snap.faces = result.faces;
                    snap.person_count = result.person_count;
                    snap.frame_size = Some(still.size);
                    snap.error = None;
                    snap.updated_at = Some(Utc::now());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "live recognition failed; loop continues");
                    snap.error = Some(e.to_string());
                    snap.updated_at = Some(Utc::now());
                }
            });
        });
        if !applied {
            tracing::debug!(epoch, "discarding result from a stopped analysis run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRecognizer, FakeSource};
    use crate::types::KnownPerson;

    struct Harness {
        client: Arc<FakeRecognizer>,
        source: Arc<FakeSource>,
        live: LiveAnalysisLoop<FakeRecognizer, FakeSource>,
        _gallery: watch::Sender<Gallery>,
        _options: watch::Sender<RecognitionOptions>,
    }

    fn harness(client: FakeRecognizer) -> Harness {
        let client = Arc::new(client);
        let source = Arc::new(FakeSource::new());
        let (gallery_tx, gallery_rx) = watch::channel(Gallery::from(Vec::<KnownPerson>::new()));
        let (options_tx, options_rx) = watch::channel(RecognitionOptions::default());
        let live = LiveAnalysisLoop::new(
            Arc::clone(&client),
            Arc::clone(&source),
            gallery_rx,
            options_rx,
            LoopTiming::default(),
        );
        Harness {
            client,
            source,
            live,
            _gallery: gallery_tx,
            _options: options_tx,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick_makes_no_calls() {
        let h = harness(FakeRecognizer::new());
        assert!(h.live.start());
        assert!(h.live.stop());
        time::sleep(ms(5_000)).await;
        assert_eq!(h.client.calls(), 0);
        assert!(h.live.snapshot().faces.is_empty());
        assert_eq!(h.live.state(), LoopState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_deliver_results() {
        let h = harness(FakeRecognizer::new());
        h.live.start();
        time::sleep(ms(1_600)).await;
        assert_eq!(h.client.calls(), 1);
        let snap = h.live.snapshot();
        assert_eq!(snap.faces.len(), 1);
        assert_eq!(snap.person_count, 1);
        assert_eq!(snap.frame_size, Some(Size::new(640, 480)));
        assert_eq!(h.live.state(), LoopState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_skips_overlapping_tick() {
        // Ticks at 1.5s, 3.0s, 4.5s; the first call holds the slot until 4.0s.
        let h = harness(FakeRecognizer::new().with_delay(ms(2_500)));
        h.live.start();
        time::sleep(ms(4_600)).await;
        h.live.stop();
        assert!(h.client.calls() <= 2);
        assert_eq!(h.client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_stop_is_discarded() {
        let h = harness(FakeRecognizer::new().with_delay(ms(2_000)));
        h.live.start();
        time::sleep(ms(1_600)).await;
        assert_eq!(h.client.calls(), 1);
        assert_eq!(h.live.state(), LoopState::AwaitingResult);

        h.live.stop();
        time::sleep(ms(3_000)).await;
        assert!(h.live.snapshot().faces.is_empty());
        assert_eq!(h.live.snapshot().person_count, 0);
        assert_eq!(h.client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_displayed_faces() {
        let h = harness(FakeRecognizer::new());
        h.live.start();
        time::sleep(ms(1_600)).await;
        assert_eq!(h.live.snapshot().faces.len(), 1);
        h.live.stop();
        assert_eq!(h.live.snapshot(), LiveSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_stop_the_loop() {
        let h = harness(FakeRecognizer::new());
        h.client.fail_all.store(true, Ordering::SeqCst);
        h.live.start();
        time::sleep(ms(1_600)).await;
        let snap = h.live.snapshot();
        assert!(snap.error.as_deref().unwrap_or_default().contains("fake failure"));
        assert!(h.live.is_armed());

        h.client.heal();
        time::sleep(ms(1_500)).await;
        let snap = h.live.snapshot();
        assert_eq!(h.client.calls(), 2);
        assert_eq!(snap.faces.len(), 1);
        assert!(snap.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_source_is_a_no_op() {
        let h = harness(FakeRecognizer::new());
        h.source.live.store(false, Ordering::SeqCst);
        h.live.start();
        time::sleep(ms(5_000)).await;
        assert_eq!(h.client.calls(), 0);
        assert_eq!(h.source.captures.load(Ordering::SeqCst), 0);
        assert_eq!(h.live.state(), LoopState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_frame_skips_call() {
        let h = harness(FakeRecognizer::new());
        h.source.ready.store(false, Ordering::SeqCst);
        h.live.start();
        time::sleep(ms(3_100)).await;
        assert_eq!(h.source.captures.load(Ordering::SeqCst), 2);
        assert_eq!(h.client.calls(), 0);
        assert!(h.live.snapshot().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_capture_frees_the_slot() {
        let h = harness(FakeRecognizer::new());
        *h.source.capture_delay.lock().unwrap() = Duration::from_secs(3600);
        h.live.start();

        // The first capture hangs from 1.5s and is abandoned at 31.5s.
        time::sleep(ms(30_000)).await;
        assert_eq!(h.source.captures.load(Ordering::SeqCst), 1);
        time::sleep(ms(3_100)).await;
        assert_eq!(h.source.captures.load(Ordering::SeqCst), 2);
        assert_eq!(h.client.calls(), 0);
        assert!(h.live.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let h = harness(FakeRecognizer::new());
        h.live.start();
        h.live.stop();
        assert!(!h.live.stop());
        assert!(h.live.start());
        assert!(!h.live.start());
        time::sleep(ms(1_600)).await;
        assert_eq!(h.client.calls(), 1);
    }
}
