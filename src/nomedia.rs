//! Opt-out of preview generation via marker files.
//!
//! A folder containing a `.nomedia` entry opts itself and its whole subtree
//! out. Positive answers are remembered per folder, negative answers are not.

use crate::backend::{FileNode, FileTree};
use crate::errors::FileTreeError;
use std::collections::HashMap;
use tracing::trace;

/// Name of the opt-out marker entry.
pub const NO_MEDIA_MARKER: &str = ".nomedia";

/// Answers whether a file lies below a folder with an opt-out marker.
///
/// One oracle lives as long as one drain pass.
#[derive(Debug, Default)]
pub struct NoMediaOracle {
    cache: HashMap<String, bool>,
}

impl NoMediaOracle {
    /// An oracle with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any ancestor folder of `file` contains the opt-out marker.
    ///
    /// A cached folder is matched by plain string prefix on the file path.
    pub async fn has_opt_out_marker<F: FileTree>(
        &mut self,
        files: &F,
        file: &FileNode,
    ) -> Result<bool, FileTreeError> {
        if let Some((dir, &has)) = self
            .cache
            .iter()
            .find(|(dir, _)| file.path.starts_with(dir.as_str()))
        {
            trace!(path = %file.path, %dir, "Opt-out answered from cache");
            return Ok(has);
        }

        let mut current = file.clone();
        loop {
            let parent = match files.parent(&current).await {
                Ok(parent) => parent,
                Err(FileTreeError::NotFound(_)) => return Ok(false),
                Err(error) => return Err(error),
            };

            if files.node_exists(&parent, NO_MEDIA_MARKER).await? {
                self.cache.insert(parent.path.clone(), true);
                return Ok(true);
            }

            current = parent;
        }
    }
}
