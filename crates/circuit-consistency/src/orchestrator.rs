//! Resumable, bounded-concurrency driver over a set of images.
//!
//! Each pending image runs in its own task behind a semaphore of width `W`.
//! Completions are handled in arrival order on the calling task, which is the
//! only place the result store is touched. A failed image is logged and left
//! without a record, so the next run picks it up again.
//!
//! ```text
//! Pending --spawn--> InFlight --ok--> Done (upserted, flushed every N)
//!                              \--err--> (logged, still Pending next run)
//! ```

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::models::ImageRecord;
use crate::store::ResultStore;

/// Per-image work.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Build the full record for one image.
    ///
    /// # Errors
    ///
    /// Any error leaves the image pending.
    async fn process(&self, image_id: &str) -> anyhow::Result<ImageRecord>;
}

/// Orchestrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Images processed concurrently.
    pub workers: usize,
    /// Completed images between flushes.
    pub checkpoint_interval: usize,
    /// Skip images the store already has.
    pub resume: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            checkpoint_interval: 10,
            resume: true,
        }
    }
}

/// Outcome counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Completion {
    image_id: String,
    result: anyhow::Result<ImageRecord>,
    processing_time: Duration,
}

/// Process every image not yet done, persisting through `store`.
///
/// # Errors
///
/// Returns an error only if the final flush fails. Intermediate flush
/// failures are logged and retried at the next checkpoint.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use circuit_consistency::orchestrator::{run, ImageProcessor, OrchestratorConfig};
/// use circuit_consistency::{ImageRecord, MemoryResultStore, ResultStore};
/// use std::sync::Arc;
///
/// struct Blank;
///
/// #[async_trait]
/// impl ImageProcessor for Blank {
///     async fn process(&self, _image_id: &str) -> anyhow::Result<ImageRecord> {
///         Ok(ImageRecord::default())
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let mut store = MemoryResultStore::default();
/// let ids = vec!["a.png".to_string()];
/// let summary = run(&mut store, &ids, Arc::new(Blank), OrchestratorConfig::default()).await?;
/// assert_eq!(summary.succeeded, 1);
/// // an empty record is stored but does not count as done
/// assert!(!store.is_done("a.png"));
/// # Ok::<(), circuit_consistency::StoreError>(())
/// # }).unwrap();
/// ```
pub async fn run<S, P>(
    store: &mut S,
    image_ids: &[String],
    processor: Arc<P>,
    config: OrchestratorConfig,
) -> Result<RunSummary, StoreError>
where
    S: ResultStore + ?Sized,
    P: ImageProcessor + ?Sized + 'static,
{
    let mut seen = HashSet::new();
    let unique: Vec<&String> = image_ids.iter().filter(|id| seen.insert(id.as_str())).collect();
    let total = unique.len();

    let (pending, skipped): (Vec<&String>, Vec<&String>) = unique
        .into_iter()
        .partition(|id| !(config.resume && store.is_done(id)));

    let mut summary = RunSummary {
        total,
        skipped: skipped.len(),
        ..RunSummary::default()
    };

    let workers = config.workers.max(1);
    let interval = config.checkpoint_interval.max(1);

    info!("=== Consistency Run Started ===");
    info!("Total images: {}", summary.total);
    info!("Already done: {}", summary.skipped);
    info!("Pending: {}", pending.len());
    info!("Max concurrent: {}", workers);

    if pending.is_empty() {
        store.flush().await?;
        return Ok(summary);
    }

    let (tx, mut rx) = mpsc::channel(100);
    let semaphore = Arc::new(Semaphore::new(workers));
    let pending_count = pending.len();

    for image_id in pending {
        let tx = tx.clone();
        let semaphore = Arc::clone(&semaphore);
        let processor = Arc::clone(&processor);
        let image_id = image_id.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let start_time = Instant::now();
            let result = processor.process(&image_id).await;
            let _ = tx
                .send(Completion {
                    image_id,
                    result,
                    processing_time: start_time.elapsed(),
                })
                .await;
        });
    }
    drop(tx);

    let mut since_flush = 0;
    while let Some(completion) = rx.recv().await {
        match completion.result {
            Ok(record) => {
                info!(
                    "Done {} ({} components) in {:.1}s",
                    completion.image_id,
                    record.component_details.len(),
                    completion.processing_time.as_secs_f64()
                );
                store.upsert(&completion.image_id, record);
                summary.succeeded += 1;
                since_flush += 1;
                if since_flush >= interval {
                    match store.flush().await {
                        Ok(()) => since_flush = 0,
                        Err(err) => error!("Checkpoint failed: {}", err),
                    }
                }
            }
            Err(err) => {
                summary.failed += 1;
                error!("Failed {}: {:#}", completion.image_id, err);
            }
        }
    }

    let lost = pending_count - summary.succeeded - summary.failed;
    if lost > 0 {
        warn!("{} image tasks ended without reporting", lost);
        summary.failed += lost;
    }

    store.flush().await?;
    info!(
        "=== Consistency Run Finished: {} ok, {} failed, {} skipped ===",
        summary.succeeded, summary.failed, summary.skipped
    );
    Ok(summary)
}
