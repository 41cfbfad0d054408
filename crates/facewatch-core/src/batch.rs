//! Batch pipeline. Drains a list of images through the recognition service
//! with a fixed pool of workers.
//!
//! Each worker pulls the next id from a shared FIFO, processes it to
//! completion, then pulls again. The run ends when every worker has
//! drained the queue. Only Pending and Error items are submitted, so
//! re-running never repeats completed work.

use crate::recognizer::{
    recognize_with_timeout, RecognitionClient, RecognitionRequest, DEFAULT_REQUEST_TIMEOUT,
};
use crate::types::{EncodedImage, Gallery, RecognitionOptions, RecognitionResult, Size};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Worker pool size when none is configured.
pub const DEFAULT_BATCH_WORKERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl BatchStatus {
    /// Pending and Error items are submitted by the next run.
    pub fn is_submittable(self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub id: String,
    /// Display label, usually the source file name.
    pub label: String,
    #[serde(skip)]
    pub source: EncodedImage,
    pub status: BatchStatus,
    pub result: Option<RecognitionResult>,
    pub intrinsic_size: Size,
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch is already running")]
    AlreadyRunning,
    #[error("no batch item with id {0}")]
    NotFound(String),
}

/// Counts for one run of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub submitted: usize,
    pub done: usize,
    pub failed: usize,
}

type Items = Arc<Mutex<Vec<BatchItem>>>;
type Queue = Arc<Mutex<VecDeque<String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resets the running flag when a run ends, including by cancellation.
struct Running(Arc<AtomicBool>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BatchPipeline<C> {
    client: Arc<C>,
    workers: usize,
    request_timeout: Duration,
    items: Items,
    running: Arc<AtomicBool>,
    selected: Mutex<Option<String>>,
}

impl<C: RecognitionClient> BatchPipeline<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            workers: DEFAULT_BATCH_WORKERS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            items: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            selected: Mutex::new(None),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Queue an image as a new Pending item and return its id.
    pub fn add(
        &self,
        label: impl Into<String>,
        source: EncodedImage,
        intrinsic_size: Size,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        lock(&self.items).push(BatchItem {
            id: id.clone(),
            label: label.into(),
            source,
            status: BatchStatus::Pending,
            result: None,
            intrinsic_size,
            error: None,
        });
        id
    }

    pub fn remove(&self, id: &str) -> Result<(), BatchError> {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() == before {
            return Err(BatchError::NotFound(id.to_string()));
        }
        drop(items);

        let mut selected = lock(&self.selected);
        if selected.as_deref() == Some(id) {
            *selected = None;
        }
        Ok(())
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
        *lock(&self.selected) = None;
    }

    /// Snapshot of every item in insertion order.
    pub fn items(&self) -> Vec<BatchItem> {
        lock(&self.items).clone()
    }

    pub fn item(&self, id: &str) -> Option<BatchItem> {
        lock(&self.items).iter().find(|item| item.id == id).cloned()
    }

    /// Mark an item for detail view. Independent of its processing state.
    pub fn select(&self, id: &str) -> Result<BatchItem, BatchError> {
        let item = self.item(id).ok_or_else(|| BatchError::NotFound(id.to_string()))?;
        *lock(&self.selected) = Some(item.id.clone());
        Ok(item)
    }

    pub fn selected(&self) -> Option<BatchItem> {
        let id = lock(&self.selected).clone()?;
        self.item(&id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Submit every Pending or Error item and wait for the pool to drain.
    pub async fn run(
        &self,
        gallery: Gallery,
        options: RecognitionOptions,
    ) -> Result<BatchSummary, BatchError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BatchError::AlreadyRunning);
        }
        let _running = Running(Arc::clone(&self.running));

        let queue: VecDeque<String> = lock(&self.items)
            .iter()
            .filter(|item| item.status.is_submittable())
            .map(|item| item.id.clone())
            .collect();
        let mut summary = BatchSummary {
            submitted: queue.len(),
            ..BatchSummary::default()
        };
        if queue.is_empty() {
            tracing::debug!("batch run: nothing to submit");
            return Ok(summary);
        }

        tracing::info!(items = queue.len(), workers = self.workers, "batch run started");
        let queue: Queue = Arc::new(Mutex::new(queue));
        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            pool.spawn(drain(
                worker,
                Arc::clone(&self.client),
                Arc::clone(&self.items),
                Arc::clone(&queue),
                gallery.clone(),
                options,
                self.request_timeout,
            ));
        }

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(stats) => {
                    summary.done += stats.done;
                    summary.failed += stats.failed;
                }
                Err(e) => tracing::error!(error = %e, "batch worker panicked"),
            }
        }

        tracing::info!(
            submitted = summary.submitted,
            done = summary.done,
            failed = summary.failed,
            "batch run finished"
        );
        Ok(summary)
    }
}

#[derive(Default)]
struct WorkerStats {
    done: usize,
    failed: usize,
}

async fn drain<C: RecognitionClient>(
    worker: usize,
    client: Arc<C>,
    items: Items,
    queue: Queue,
    gallery: Gallery,
    options: RecognitionOptions,
    request_timeout: Duration,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    loop {
        let Some(id) = lock(&queue).pop_front() else {
            break;
        };
        let Some(image) = claim(&items, &id) else {
            tracing::debug!(worker, id = %id, "batch item gone or already claimed; skipping");
            continue;
        };

        let request = RecognitionRequest {
            image,
            gallery: gallery.clone(),
            options,
        };
        let outcome = recognize_with_timeout(client.as_ref(), request, request_timeout).await;

        let mut slots = lock(&items);
        let Some(item) = slots.iter_mut().find(|item| item.id == id) else {
            continue;
        };
        match outcome {
            Ok(result) => {
                tracing::debug!(worker, id = %id, faces = result.faces.len(), "batch item done");
                item.status = BatchStatus::Done;
                item.result = Some(result);
                item.error = None;
                stats.done += 1;
            }
            Err(e) => {
                tracing::warn!(worker, id = %id, error = %e, "batch item failed");
                item.status = BatchStatus::Error;
                item.result = None;
                item.error = Some(e.to_string());
                stats.failed += 1;
            }
        }
    }
    stats
}

/// Move a submittable item to Processing and hand back its image.
fn claim(items: &Mutex<Vec<BatchItem>>, id: &str) -> Option<EncodedImage> {
    let mut items = lock(items);
    let item = items
        .iter_mut()
        .find(|item| item.id == id && item.status.is_submittable())?;
    item.status = BatchStatus::Processing;
    Some(item.source.clone())
}
