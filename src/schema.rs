//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the preview generation queue.

use serde::Serialize;
use sqlx::FromRow;

/// Represents one file waiting for its previews in the `preview_generation` table
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct QueueEntry {
    /// Unique identifier of the row, also the FIFO order of the queue
    pub id: i64,
    /// Account that owns the file
    pub uid: String,
    /// Identifier of the file within the storage tree
    pub file_id: i64,
    /// Unix timestamp of the enqueue, `NULL` for rows older than the column
    pub queued_at: Option<i64>,
}
