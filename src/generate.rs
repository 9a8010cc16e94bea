//! Rendering previews for whole trees instead of the queue.
//!
//! Every worker of a pool walks the complete scope and only renders the files
//! assigned to its partition, so no file is lost between workers.

use crate::backend::{AccountDirectory, Backend, FileNode, FileTree, NodeKind, Renderer};
use crate::config::PreviewSettings;
use crate::errors::{FileTreeError, PreGenerateError};
use crate::nomedia::NO_MEDIA_MARKER;
use crate::partition::WorkerPartition;
use crate::queue::Queue;
use crate::sizes::RenderSpecification;
use crate::worker::{
    Outcome, RunSummary, StopReason, check_encryption, log_specifications, render_file,
};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Which part of the storage tree to walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Scope {
    /// The files of every known account
    #[default]
    AllAccounts,
    /// The files of the listed accounts, unknown ones are ignored
    Accounts(Vec<String>),
    /// Subtrees given as `/<account>/files/...`
    Paths(Vec<String>),
}

/// Account a `/<account>/...` path belongs to, after normalizing slashes.
fn path_owner(path: &str) -> Option<&str> {
    path.trim_matches('/').split('/').next().filter(|owner| !owner.is_empty())
}

/// Walks a [`Scope`] and renders previews for every supported file.
pub struct Generator<F, R, A> {
    queue: Queue,
    backend: Arc<Backend<F, R, A>>,
    previews: PreviewSettings,
    partition: Option<WorkerPartition>,
}

impl<F, R, A> std::fmt::Debug for Generator<F, R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("partition", &self.partition)
            .finish()
    }
}

impl<F: FileTree, R: Renderer, A: AccountDirectory> Generator<F, R, A> {
    /// An unpartitioned generator.
    pub fn new(queue: Queue, backend: Arc<Backend<F, R, A>>, previews: PreviewSettings) -> Self {
        Self {
            queue,
            backend,
            previews,
            partition: None,
        }
    }

    /// Only render files assigned to `partition`.
    pub fn partition(mut self, partition: WorkerPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Walk `scope` once.
    pub async fn run(&self, scope: &Scope) -> Result<RunSummary, PreGenerateError> {
        check_encryption(&self.backend.files).await?;

        let specifications = self.previews.specifications();
        log_specifications(&specifications);

        let mut summary = RunSummary {
            stop: StopReason::Completed,
            ..RunSummary::default()
        };

        match scope {
            Scope::AllAccounts => {
                let accounts = self
                    .backend
                    .accounts
                    .known_accounts()
                    .await
                    .map_err(PreGenerateError::Accounts)?;
                for account in accounts {
                    self.generate_account(&account.id, &specifications, &mut summary)
                        .await?;
                }
            }
            Scope::Accounts(ids) => {
                for id in ids {
                    if self.account_exists(id).await? {
                        self.generate_account(id, &specifications, &mut summary)
                            .await?;
                    }
                }
            }
            Scope::Paths(paths) => {
                for path in paths {
                    let path = format!("/{}", path.trim_matches('/'));
                    let Some(owner) = path_owner(&path) else {
                        continue;
                    };
                    if self.account_exists(owner).await? {
                        self.generate_path(owner, &path, &specifications, &mut summary)
                            .await?;
                    }
                }
            }
        }

        info!(
            processed = summary.processed,
            rendered = summary.rendered,
            failed = summary.failed,
            "Tree walk finished"
        );
        Ok(summary)
    }

    async fn account_exists(&self, id: &str) -> Result<bool, PreGenerateError> {
        let exists = self
            .backend
            .accounts
            .exists(id)
            .await
            .map_err(PreGenerateError::Accounts)?;
        if !exists {
            debug!(account = id, "Unknown account, ignoring");
        }
        Ok(exists)
    }

    async fn generate_account(
        &self,
        owner: &str,
        specifications: &[RenderSpecification],
        summary: &mut RunSummary,
    ) -> Result<(), PreGenerateError> {
        let folder = match self.backend.files.user_folder(owner).await {
            Ok(folder) => folder,
            Err(FileTreeError::NotFound(_)) => {
                debug!(account = owner, "Account has no files");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let mounts = self.backend.files.no_preview_mounts(owner).await?;
        self.walk(folder, &mounts, specifications, summary).await
    }

    async fn generate_path(
        &self,
        owner: &str,
        path: &str,
        specifications: &[RenderSpecification],
        summary: &mut RunSummary,
    ) -> Result<(), PreGenerateError> {
        // only the user folder is scanned, never the trash or versions beside it
        let folder = match self.backend.files.user_folder(owner).await {
            Ok(folder) => folder,
            Err(FileTreeError::NotFound(_)) => {
                info!(owner, "User folder not found");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };
        let inside = path
            .strip_prefix(folder.path.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if !inside {
            info!(path, "Path not found");
            return Ok(());
        }

        let node = match self.backend.files.get(path).await {
            Ok(node) => node,
            Err(FileTreeError::NotFound(_)) => {
                info!(path, "Path not found");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        match node.kind {
            NodeKind::Folder => {
                let mounts = self.backend.files.no_preview_mounts(owner).await?;
                self.walk(node, &mounts, specifications, summary).await
            }
            NodeKind::File => self.generate_file(&node, specifications, summary).await,
        }
    }

    /// Depth first walk below `root`, skipping opted out folders.
    async fn walk(
        &self,
        root: FileNode,
        no_preview_mounts: &[String],
        specifications: &[RenderSpecification],
        summary: &mut RunSummary,
    ) -> Result<(), PreGenerateError> {
        let mut pending = vec![root];

        while let Some(folder) = pending.pop() {
            let children = match self.scan_folder(&folder, no_preview_mounts).await {
                Ok(Some(children)) => children,
                Ok(None) => continue,
                Err(FileTreeError::StorageUnavailable { path, reason }) => {
                    error!("Storage for folder {path} is not available: {reason}");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            let mut subfolders = Vec::new();
            for child in children {
                match child.kind {
                    NodeKind::Folder => subfolders.push(child),
                    NodeKind::File => self.generate_file(&child, specifications, summary).await?,
                }
            }
            pending.extend(subfolders.into_iter().rev());
        }

        Ok(())
    }

    /// Children of `folder`, or `None` if the folder is excluded.
    async fn scan_folder(
        &self,
        folder: &FileNode,
        no_preview_mounts: &[String],
    ) -> Result<Option<Vec<FileNode>>, FileTreeError> {
        let files = &self.backend.files;

        if files.node_exists(folder, NO_MEDIA_MARKER).await?
            || no_preview_mounts.iter().any(|mount| *mount == folder.path)
        {
            info!("Skipping folder {}", folder.path);
            return Ok(None);
        }

        info!("Scanning folder {}", folder.path);
        files.list(folder).await.map(Some)
    }

    async fn generate_file(
        &self,
        file: &FileNode,
        specifications: &[RenderSpecification],
        summary: &mut RunSummary,
    ) -> Result<(), PreGenerateError> {
        if let Some(partition) = self.partition {
            if !partition.is_mine(file.id) {
                trace!(path = %file.path, %partition, "File belongs to another worker");
                summary.record(Outcome::Foreign);
                return Ok(());
            }
        }

        let outcome = render_file(&self.backend.renderer, file, specifications).await?;
        summary.record(outcome);

        // queued writes of this file are covered now
        let removed = self.queue.remove_file(file.id).await?;
        if removed > 0 {
            debug!(path = %file.path, removed, "Removed pending queue entries");
        }
        Ok(())
    }
}
