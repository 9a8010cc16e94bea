use thiserror::Error;

/// Error type for queue insertion operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Database operation failed
    #[error("Error while enqueueing file for preview generation: {0}")]
    DatabaseError(#[from] sqlx::Error),
    /// The owner of the written node could not be checked
    #[error("Error while looking up the owner of {path}")]
    AccountLookup {
        /// Path of the written node
        path: String,
        /// Underlying account directory failure
        #[source]
        source: anyhow::Error,
    },
}

/// Failures reported by a [`FileTree`](crate::FileTree) implementation.
#[derive(Debug, Error)]
pub enum FileTreeError {
    /// The node does not exist. Asking for the parent of the root also yields this.
    #[error("Node not found: {0}")]
    NotFound(String),
    /// The storage backing a folder cannot be reached right now
    #[error("Storage for folder {path} is not available: {reason}")]
    StorageUnavailable {
        /// Folder whose storage failed
        path: String,
        /// Human readable cause
        reason: String,
    },
    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures reported by a [`Renderer`](crate::Renderer).
///
/// Only [`RenderError::Persistence`] aborts a run, every other variant
/// concerns the one file being rendered.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The file vanished between dequeue and rendering
    #[error("File not found: {0}")]
    NotFound(String),
    /// The file cannot be rendered with the requested specifications
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The rendering engine failed on this file
    #[error("Rendering failed: {0}")]
    Failed(String),
    /// Another process stored the same preview concurrently
    #[error("Preview already exists: {0}")]
    DuplicateArtifact(String),
    /// Storing the rendered previews failed
    #[error("Failed to persist previews")]
    Persistence(#[source] anyhow::Error),
}

impl From<sqlx::Error> for RenderError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                Self::DuplicateArtifact(db_error.message().to_string())
            }
            _ => Self::Persistence(error.into()),
        }
    }
}

/// Errors that stop a pre-generation or generate-all run.
#[derive(Debug, Error)]
pub enum PreGenerateError {
    /// Server side encryption is enabled in a way previews can't be generated for
    #[error("Encryption is enabled. Aborted.")]
    EncryptionIncompatible,
    /// Another run holds the lease
    #[error("Preview generation is already running")]
    AlreadyRunning,
    /// Acquiring or releasing the run lease failed
    #[error("Failed to manage the run lease")]
    Lease(#[source] anyhow::Error),
    /// Queue access failed
    #[error("Queue access failed: {0}")]
    Database(#[from] sqlx::Error),
    /// The file tree failed in a way that is not a stale reference
    #[error("File tree access failed: {0}")]
    FileTree(#[from] FileTreeError),
    /// The account directory failed
    #[error("Account lookup failed")]
    Accounts(#[source] anyhow::Error),
    /// Storing rendered previews failed for a reason other than a duplicate
    #[error("Failed to persist previews for file {file_id}")]
    Persistence {
        /// File being rendered when the failure happened
        file_id: i64,
        /// Underlying storage failure
        #[source]
        source: anyhow::Error,
    },
}

impl PreGenerateError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning => 2,
            _ => 1,
        }
    }
}

/// Why one worker of a [`Runner`](crate::Runner) did not finish successfully.
#[derive(Debug, Error)]
pub enum WorkerFailure {
    /// The worker returned an error
    #[error("worker {index} failed: {source}")]
    Failed {
        /// Partition index of the worker
        index: u32,
        /// Error returned by the worker
        #[source]
        source: PreGenerateError,
    },
    /// The worker task panicked or was aborted
    #[error("worker {index} panicked: {message}")]
    Panicked {
        /// Partition index of the worker
        index: u32,
        /// Panic payload, if it could be extracted
        message: String,
    },
}

impl WorkerFailure {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Failed { source, .. } => source.exit_code(),
            Self::Panicked { .. } => 1,
        }
    }
}

/// Aggregated failure of a worker pool run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run was refused before any worker started
    #[error(transparent)]
    NotStarted(PreGenerateError),
    /// At least one worker failed. Its siblings were left to finish.
    #[error("{} of {total} workers failed", failures.len())]
    WorkersFailed {
        /// Number of workers in the pool
        total: usize,
        /// One entry per failed worker
        failures: Vec<WorkerFailure>,
    },
}

impl RunError {
    /// Process exit code of the whole run: the highest code of any failed worker.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotStarted(source) => source.exit_code(),
            Self::WorkersFailed { failures, .. } => failures
                .iter()
                .map(WorkerFailure::exit_code)
                .max()
                .unwrap_or(1),
        }
    }
}
