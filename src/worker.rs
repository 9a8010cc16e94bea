use crate::backend::{AccountDirectory, Backend, FileNode, FileTree, Renderer};
use crate::config::PreviewSettings;
use crate::errors::{FileTreeError, PreGenerateError, RenderError};
use crate::limiter::{Limiter, MultiLimiter};
use crate::nomedia::NoMediaOracle;
use crate::partition::WorkerPartition;
use crate::queue::Queue;
use crate::schema::QueueEntry;
use crate::sizes::RenderSpecification;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Why a drain pass ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing was left to claim
    #[default]
    QueueEmpty,
    /// The limiter refused the next claim
    LimiterExhausted,
    /// A full tree walk finished
    Completed,
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Rendered,
    Skipped,
    Foreign,
    Failed,
}

/// Counters of one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Files taken from the queue or found in the tree
    pub processed: u64,
    /// Files whose previews were rendered or already existed
    pub rendered: u64,
    /// Files discarded as stale, excluded or unsupported
    pub skipped: u64,
    /// Files left to another worker of the pool
    pub foreign: u64,
    /// Files the renderer failed on
    pub failed: u64,
    /// Why the run ended
    pub stop: StopReason,
}

impl RunSummary {
    pub(crate) fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Rendered => self.rendered += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Foreign => self.foreign += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Fails unless previews can be generated under the current encryption setup.
pub(crate) async fn check_encryption<F: FileTree>(files: &F) -> Result<(), PreGenerateError> {
    let state = files
        .encryption()
        .await
        .map_err(|e| PreGenerateError::FileTree(FileTreeError::Other(e)))?;

    if !state.is_compatible() {
        return Err(PreGenerateError::EncryptionIncompatible);
    }
    Ok(())
}

pub(crate) fn log_specifications(specifications: &[RenderSpecification]) {
    if let Ok(json) = serde_json::to_string(specifications) {
        debug!(specifications = %json, "Specifications");
    }
}

/// Render `file` and classify the result.
///
/// Only storage failures other than a duplicate preview are returned as errors.
pub(crate) async fn render_file<R: Renderer>(
    renderer: &R,
    file: &FileNode,
    specifications: &[RenderSpecification],
) -> Result<Outcome, PreGenerateError> {
    if !renderer.is_supported(&file.mime_type) {
        debug!(path = %file.path, mime_type = %file.mime_type, "Unsupported mime type, skipping");
        return Ok(Outcome::Skipped);
    }

    debug!(path = %file.path, "Generating previews…");

    let result = with_sentry_transaction("previews.render", move || async move {
        AssertUnwindSafe(renderer.render(file, specifications))
            .catch_unwind()
            .await
            .map_err(|e| RenderError::Failed(try_to_extract_panic_info(&*e)))
            .and_then(std::convert::identity)
    })
    .await;

    match result {
        Ok(()) => Ok(Outcome::Rendered),
        Err(RenderError::NotFound(_)) => {
            debug!(path = %file.path, "File vanished while rendering");
            Ok(Outcome::Skipped)
        }
        Err(error @ (RenderError::InvalidArgument(_) | RenderError::Failed(_))) => {
            warn!(path = %file.path, "{error}");
            Ok(Outcome::Failed)
        }
        Err(RenderError::DuplicateArtifact(reason)) => {
            debug!(path = %file.path, %reason, "Previews were stored concurrently");
            Ok(Outcome::Rendered)
        }
        Err(RenderError::Persistence(source)) => Err(PreGenerateError::Persistence {
            file_id: file.id,
            source,
        }),
    }
}

/// Drains the queue until it is empty or the limiter says stop.
///
/// One worker processes one claimed row at a time. Running several workers
/// with distinct partitions of the same pool splits the files between them.
pub struct Worker<F, R, A> {
    queue: Queue,
    backend: Arc<Backend<F, R, A>>,
    previews: PreviewSettings,
    partition: Option<WorkerPartition>,
    limiter: Limiter,
}

impl<F, R, A> std::fmt::Debug for Worker<F, R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("partition", &self.partition)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl<F: FileTree, R: Renderer, A: AccountDirectory> Worker<F, R, A> {
    /// An unpartitioned, unlimited worker.
    pub fn new(queue: Queue, backend: Arc<Backend<F, R, A>>, previews: PreviewSettings) -> Self {
        Self {
            queue,
            backend,
            previews,
            partition: None,
            limiter: MultiLimiter::default().into(),
        }
    }

    /// Only handle files assigned to `partition`.
    pub fn partition(mut self, partition: WorkerPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Stop once `limiter` refuses the next file.
    pub fn limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Drain the queue once.
    pub async fn run(&mut self) -> Result<RunSummary, PreGenerateError> {
        check_encryption(&self.backend.files).await?;

        info!(limiter = self.limiter.name(), "Using limiter");
        let specifications = self.previews.specifications();
        log_specifications(&specifications);

        let mut oracle = NoMediaOracle::new();
        let mut summary = RunSummary::default();

        summary.stop = loop {
            if !self.limiter.next() {
                debug!("Limiter exhausted, stopping");
                break StopReason::LimiterExhausted;
            }

            let Some(entry) = self.queue.claim_oldest().await? else {
                debug!("Queue is empty, stopping");
                break StopReason::QueueEmpty;
            };

            trace!(entry.id = entry.id, entry.uid = %entry.uid, entry.file_id = entry.file_id, "Claimed entry");
            let outcome = self
                .process_entry(&entry, &specifications, &mut oracle)
                .await?;
            summary.record(outcome);
        };

        info!(
            processed = summary.processed,
            rendered = summary.rendered,
            failed = summary.failed,
            "Drain pass finished"
        );
        Ok(summary)
    }

    async fn process_entry(
        &self,
        entry: &QueueEntry,
        specifications: &[RenderSpecification],
        oracle: &mut NoMediaOracle,
    ) -> Result<Outcome, PreGenerateError> {
        let backend = &self.backend;

        let account = backend
            .accounts
            .get(&entry.uid)
            .await
            .map_err(PreGenerateError::Accounts)?;
        if account.is_none() {
            debug!(uid = %entry.uid, "Account no longer exists, discarding entry");
            return Ok(Outcome::Skipped);
        }

        let file = match backend.files.resolve(&entry.uid, entry.file_id).await {
            Ok(Some(file)) => file,
            Ok(None) | Err(FileTreeError::NotFound(_)) => {
                debug!(file_id = entry.file_id, "File no longer exists, discarding entry");
                return Ok(Outcome::Skipped);
            }
            Err(error) => return Err(error.into()),
        };

        if !file.is_file() {
            debug!(path = %file.path, "Not a file, discarding entry");
            return Ok(Outcome::Skipped);
        }

        if file.is_in_trash() {
            debug!(path = %file.path, "File is in the trash, skipping");
            return Ok(Outcome::Skipped);
        }

        if oracle.has_opt_out_marker(&backend.files, &file).await? {
            debug!(path = %file.path, "Folder opted out of previews, skipping");
            return Ok(Outcome::Skipped);
        }

        if let Some(partition) = self.partition {
            if !partition.is_mine(file.id) {
                debug!(path = %file.path, %partition, "File belongs to another worker, dropping");
                return Ok(Outcome::Foreign);
            }
        }

        render_file(&backend.renderer, &file, specifications).await
    }
}
