use crate::backend::{AccountDirectory, Backend, FileTree, Renderer};
use crate::config::{BackgroundMode, JobSettings, PreviewSettings};
use crate::errors::PreGenerateError;
use crate::limiter::{Clock, LimiterFactory};
use crate::queue::Queue;
use crate::worker::{RunSummary, Worker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// How often the host scheduler should invoke [`PreviewJob::run`].
pub const JOB_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Result of one background job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is switched off
    Disabled,
    /// The host does not run background jobs from cron
    NotCron,
    /// Encryption prevents preview generation, nothing was done
    EncryptionIncompatible,
    /// The queue was drained
    Ran(RunSummary),
}

/// Periodic queue drain with the configured budgets.
pub struct PreviewJob<F, R, A> {
    queue: Queue,
    backend: Arc<Backend<F, R, A>>,
    previews: PreviewSettings,
    settings: JobSettings,
    limiters: LimiterFactory,
}

impl<F: FileTree, R: Renderer, A: AccountDirectory> PreviewJob<F, R, A> {
    /// A job whose execution time budget is measured with `clock`.
    pub fn new(
        queue: Queue,
        backend: Arc<Backend<F, R, A>>,
        previews: PreviewSettings,
        settings: JobSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiters =
            LimiterFactory::new(settings.max_previews, settings.max_execution_time, clock);
        Self {
            queue,
            backend,
            previews,
            settings,
            limiters,
        }
    }

    /// Run one invocation.
    #[instrument(name = "previews.job", skip(self))]
    pub async fn run(&self) -> Result<JobOutcome, PreGenerateError> {
        if self.settings.disabled {
            debug!("Background job is disabled");
            return Ok(JobOutcome::Disabled);
        }
        if self.settings.background_mode != BackgroundMode::Cron {
            debug!(mode = ?self.settings.background_mode, "Background jobs do not run from cron");
            return Ok(JobOutcome::NotCron);
        }

        let mut worker = Worker::new(
            self.queue.clone(),
            self.backend.clone(),
            self.previews.clone(),
        )
        .limiter(self.limiters.build());

        match worker.run().await {
            Ok(summary) => Ok(JobOutcome::Ran(summary)),
            Err(PreGenerateError::EncryptionIncompatible) => Ok(JobOutcome::EncryptionIncompatible),
            Err(error) => Err(error),
        }
    }
}
