use crate::backend::{AccountDirectory, FileNode};
use crate::errors::EnqueueError;
use crate::queue::Queue;
use tracing::trace;

/// Queue a written node for preview generation.
///
/// Folders and nodes outside of a known account are ignored. Returns the id
/// of the new queue row, `None` if nothing was queued.
pub async fn on_node_written<A: AccountDirectory>(
    queue: &Queue,
    accounts: &A,
    node: &FileNode,
    now: i64,
) -> Result<Option<i64>, EnqueueError> {
    if !node.is_file() {
        return Ok(None);
    }
    let Some(owner) = node.owner() else {
        return Ok(None);
    };

    let account = accounts
        .get(owner)
        .await
        .map_err(|source| EnqueueError::AccountLookup {
            path: node.path.clone(),
            source,
        })?;
    if account.is_none() {
        trace!(path = %node.path, "Written node has no known owner");
        return Ok(None);
    }

    queue.enqueue(owner, node.id, Some(now)).await
}
