use crate::backend::{AccountDirectory, Backend, FileTree, Lease, Renderer};
use crate::config::PreviewSettings;
use crate::errors::{PreGenerateError, RunError, WorkerFailure};
use crate::generate::{Generator, Scope};
use crate::limiter::{LimiterFactory, SystemClock};
use crate::partition::WorkerPartition;
use crate::queue::Queue;
use crate::util::try_to_extract_panic_info;
use crate::worker::{RunSummary, Worker, check_encryption};
use futures_util::FutureExt;
use futures_util::future::join_all;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, info, info_span, warn};

/// What the workers of a run do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Drain the queue
    PreGenerate,
    /// Walk the given scope of the storage tree
    GenerateAll(Scope),
}

/// Spawns a fixed pool of statically partitioned workers.
///
/// Workers never coordinate. Each one gets its own partition descriptor and
/// limiter, and a failing worker does not stop its siblings.
pub struct Runner<F, R, A> {
    queue: Queue,
    backend: Arc<Backend<F, R, A>>,
    previews: PreviewSettings,
    num_workers: u32,
    jitter: Duration,
    limiters: LimiterFactory,
}

impl<F, R, A> std::fmt::Debug for Runner<F, R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("jitter", &self.jitter)
            .field("limiters", &self.limiters)
            .finish()
    }
}

impl<F: FileTree, R: Renderer, A: AccountDirectory> Runner<F, R, A> {
    /// A runner with one unlimited worker.
    pub fn new(queue: Queue, backend: Arc<Backend<F, R, A>>, previews: PreviewSettings) -> Self {
        Self {
            queue,
            backend,
            previews,
            num_workers: 1,
            jitter: Duration::ZERO,
            limiters: LimiterFactory::new(0, 0, Arc::new(SystemClock)),
        }
    }

    /// Set the number of workers. More than one partitions the files.
    pub fn num_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set the maximum random delay before a worker starts.
    ///
    /// Spreads the first claims of the pool so the workers do not all hit the
    /// head of the queue at the same instant.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Give every queue draining worker a fresh limiter from `limiters`.
    pub fn limiters(mut self, limiters: LimiterFactory) -> Self {
        self.limiters = limiters;
        self
    }

    fn startup_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
    }

    /// A single worker is left unpartitioned.
    fn partitions(&self) -> Vec<Option<WorkerPartition>> {
        if self.num_workers == 1 {
            return vec![None];
        }

        (0..self.num_workers)
            .filter_map(|index| WorkerPartition::new(index, self.num_workers).ok())
            .map(Some)
            .collect()
    }

    /// Check the preconditions and spawn the workers.
    pub async fn start(&self, mode: Mode) -> Result<RunHandle, RunError> {
        check_encryption(&self.backend.files)
            .await
            .map_err(RunError::NotStarted)?;

        let partitions = self.partitions();
        let mut handles = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let index = partition.map(|p| p.index()).unwrap_or_default();
            let name = match partition {
                Some(partition) => format!("preview-worker-{partition}"),
                None => "preview-worker".to_string(),
            };
            info!(worker.name = %name, "Starting worker…");

            let delay = self.startup_delay();
            let span = info_span!("worker", worker.name = %name);
            let future = match &mode {
                Mode::PreGenerate => {
                    let mut worker = Worker::new(
                        self.queue.clone(),
                        self.backend.clone(),
                        self.previews.clone(),
                    )
                    .limiter(self.limiters.build());
                    if let Some(partition) = partition {
                        worker = worker.partition(partition);
                    }
                    async move {
                        sleep(delay).await;
                        worker.run().await
                    }
                    .boxed()
                }
                Mode::GenerateAll(scope) => {
                    let mut generator = Generator::new(
                        self.queue.clone(),
                        self.backend.clone(),
                        self.previews.clone(),
                    );
                    if let Some(partition) = partition {
                        generator = generator.partition(partition);
                    }
                    let scope = scope.clone();
                    async move {
                        sleep(delay).await;
                        generator.run(&scope).await
                    }
                    .boxed()
                }
            };

            let handle = tokio::spawn(future.instrument(span).bind_hub(Hub::current()));
            handles.push((index, handle));
        }

        Ok(RunHandle { handles })
    }

    /// Hold `lease` for the whole run. Fails fast if somebody else holds it.
    pub async fn run_exclusive<L: Lease>(
        &self,
        lease: &L,
        mode: Mode,
    ) -> Result<Vec<RunSummary>, RunError> {
        let acquired = lease
            .try_acquire()
            .await
            .map_err(|e| RunError::NotStarted(PreGenerateError::Lease(e)))?;
        if !acquired {
            return Err(RunError::NotStarted(PreGenerateError::AlreadyRunning));
        }

        let result = match self.start(mode).await {
            Ok(handle) => handle.wait_for_shutdown().await,
            Err(error) => Err(error),
        };

        if let Err(error) = lease.release().await {
            warn!("Failed to release the run lease: {error}");
        }
        result
    }
}

/// Handle to the workers of a running pool.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<(u32, JoinHandle<Result<RunSummary, PreGenerateError>>)>,
}

impl RunHandle {
    /// Wait for every worker to exit.
    ///
    /// Returns the summaries in partition order, or every failure if at least
    /// one worker failed.
    pub async fn wait_for_shutdown(self) -> Result<Vec<RunSummary>, RunError> {
        let total = self.handles.len();
        let (indices, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();

        let mut summaries = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (index, result) in indices.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(source)) => {
                    warn!(worker.index = index, "Worker failed: {source}");
                    failures.push(WorkerFailure::Failed { index, source });
                }
                Err(error) => {
                    warn!(worker.index = index, %error, "Worker task panicked");
                    let message = match error.try_into_panic() {
                        Ok(payload) => try_to_extract_panic_info(&*payload),
                        Err(error) => error.to_string(),
                    };
                    failures.push(WorkerFailure::Panicked { index, message });
                }
            }
        }

        if failures.is_empty() {
            Ok(summaries)
        } else {
            Err(RunError::WorkersFailed { total, failures })
        }
    }
}
