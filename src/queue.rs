use crate::errors::EnqueueError;
use crate::schema::QueueEntry;
use crate::storage;
use sqlx::PgPool;
use tracing::{instrument, trace};

/// The durable queue of files waiting for their previews.
///
/// Rows are claimed in insertion order and deleted as part of the claim. A
/// claimed row that fails later is not retried: the next write of the file
/// queues it again.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    /// A queue backed by the `preview_generation` table reachable through `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Queue `file_id` of `uid` unless it is already waiting.
    ///
    /// Returns the id of the new row, or `None` if a row existed.
    #[instrument(name = "previews.enqueue", skip(self))]
    pub async fn enqueue(
        &self,
        uid: &str,
        file_id: i64,
        queued_at: Option<i64>,
    ) -> Result<Option<i64>, EnqueueError> {
        let id = storage::enqueue(&self.pool, uid, file_id, queued_at).await?;
        if id.is_none() {
            trace!("File is already queued");
        }
        Ok(id)
    }

    /// Remove and return the oldest row, `None` if the queue is empty.
    ///
    /// Concurrent callers never receive the same row.
    pub async fn claim_oldest(&self) -> Result<Option<QueueEntry>, sqlx::Error> {
        storage::claim_oldest(&self.pool).await
    }

    /// Rows that have waited at least `age` seconds at `now`, or every row
    /// when `age` is `None`.
    pub async fn count_older_than(&self, now: i64, age: Option<i64>) -> Result<i64, sqlx::Error> {
        storage::count_queued_before(&self.pool, age.map(|age| now.saturating_sub(age))).await
    }

    /// Whether `file_id` still waits for its previews.
    pub async fn is_pending(&self, file_id: i64) -> Result<bool, sqlx::Error> {
        storage::file_is_queued(&self.pool, file_id).await
    }

    /// Drop every row of `file_id`. Returns the number of removed rows.
    pub async fn remove_file(&self, file_id: i64) -> Result<u64, sqlx::Error> {
        storage::delete_file_entries(&self.pool, file_id).await
    }
}
