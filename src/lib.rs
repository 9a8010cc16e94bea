#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backend;
/// TOML configuration.
pub mod config;
mod errors;
mod generate;
mod job;
mod lease;
/// Stop conditions of a drain pass.
pub mod limiter;
mod listener;
/// Collaborators over a local directory tree.
pub mod local;
mod nomedia;
mod partition;
mod queue;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Preview size derivation.
pub mod sizes;
/// Queue age statistics.
pub mod stats;
mod storage;
mod util;
mod worker;

/// Collaborator traits and the types they exchange.
pub use self::backend::{
    Account, AccountDirectory, Backend, EncryptionState, FileNode, FileTree, Lease, NodeKind,
    Renderer, TRASH_FOLDER, parent_path,
};
/// Error types.
pub use self::errors::{
    EnqueueError, FileTreeError, PreGenerateError, RenderError, RunError, WorkerFailure,
};
/// Whole tree preview generation.
pub use self::generate::{Generator, Scope};
/// The periodic background job.
pub use self::job::{JOB_INTERVAL, JobOutcome, PreviewJob};
/// Run lease backed by an advisory lock.
pub use self::lease::{AdvisoryLease, DEFAULT_LEASE_KEY};
/// Producer side of the queue.
pub use self::listener::on_node_written;
/// Opt-out marker lookups.
pub use self::nomedia::{NO_MEDIA_MARKER, NoMediaOracle};
/// Static partitioning of files between workers.
pub use self::partition::{PartitionError, WorkerPartition, abs_mod, assign};
/// The durable queue.
pub use self::queue::Queue;
/// Worker pool orchestration.
pub use self::runner::{Mode, RunHandle, Runner};
/// Schema setup.
pub use self::storage::setup_database;
/// The queue drain.
pub use self::worker::{RunSummary, StopReason, Worker};
