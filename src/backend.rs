//! Capabilities the queue and the workers depend on but do not implement.
//!
//! The file tree, the renderer and the account directory are provided by the
//! host. The [`local`](crate::local) module bundles implementations over a
//! plain directory tree.

use crate::errors::{FileTreeError, RenderError};
use crate::sizes::RenderSpecification;
use std::future::Future;

/// Name of the trash subtree directly below an account root.
pub const TRASH_FOLDER: &str = "files_trashbin";

/// Whether a node is a regular file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file, previews can be rendered for it
    File,
    /// Folder
    Folder,
}

/// A node of the storage tree.
///
/// `path` is the virtual absolute path, `/<owner>/files/...` for files of an
/// account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    /// Stable identifier within the tree
    pub id: i64,
    /// Virtual absolute path
    pub path: String,
    /// Detected mime type
    pub mime_type: String,
    /// File or folder
    pub kind: NodeKind,
}

impl FileNode {
    /// Whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// The account owning this node, the first component of its path.
    pub fn owner(&self) -> Option<&str> {
        self.components().next()
    }

    /// Whether the node lives in the trash of its owner.
    pub fn is_in_trash(&self) -> bool {
        self.components().nth(1) == Some(TRASH_FOLDER)
    }

    /// Last component of the path.
    pub fn name(&self) -> &str {
        self.components().last().unwrap_or_default()
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.path.trim_start_matches('/').split('/').filter(|c| !c.is_empty())
    }
}

/// Path of the folder containing `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        _ if trimmed.is_empty() => None,
        Some(0) => Some("/"),
        Some(index) => Some(&trimmed[..index]),
        None => None,
    }
}

/// A known account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Account identifier, also the first component of its paths
    pub id: String,
}

/// Server side encryption setup of the file tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// Files are stored in plain
    Disabled,
    /// Encryption is enabled with a working module
    Enabled {
        /// Whether the module needs to know every account with access to a file
        needs_detailed_access_list: bool,
    },
    /// Encryption is enabled but the configured module is not available
    MissingModule,
}

impl EncryptionState {
    /// Whether previews can be generated under this setup.
    pub fn is_compatible(&self) -> bool {
        match self {
            Self::Disabled => true,
            Self::Enabled {
                needs_detailed_access_list,
            } => !needs_detailed_access_list,
            Self::MissingModule => false,
        }
    }
}

/// Hierarchical file storage.
pub trait FileTree: Send + Sync + 'static {
    /// Current encryption setup.
    fn encryption(&self) -> impl Future<Output = anyhow::Result<EncryptionState>> + Send;

    /// Find the node with `file_id` among the nodes of `owner`.
    fn resolve(
        &self,
        owner: &str,
        file_id: i64,
    ) -> impl Future<Output = Result<Option<FileNode>, FileTreeError>> + Send;

    /// Node at the virtual absolute `path`.
    fn get(&self, path: &str) -> impl Future<Output = Result<FileNode, FileTreeError>> + Send;

    /// The `/<owner>/files` folder.
    fn user_folder(&self, owner: &str)
    -> impl Future<Output = Result<FileNode, FileTreeError>> + Send;

    /// Direct children of `folder`.
    fn list(
        &self,
        folder: &FileNode,
    ) -> impl Future<Output = Result<Vec<FileNode>, FileTreeError>> + Send;

    /// Whether `folder` has a direct child called `name`.
    fn node_exists(
        &self,
        folder: &FileNode,
        name: &str,
    ) -> impl Future<Output = Result<bool, FileTreeError>> + Send;

    /// Folder containing `node`. Fails with [`FileTreeError::NotFound`] for the root.
    fn parent(&self, node: &FileNode)
    -> impl Future<Output = Result<FileNode, FileTreeError>> + Send;

    /// Absolute paths of mount points of `owner` that have previews disabled.
    fn no_preview_mounts(
        &self,
        _owner: &str,
    ) -> impl Future<Output = Result<Vec<String>, FileTreeError>> + Send {
        async { Ok(Vec::new()) }
    }
}

/// Preview rendering engine.
pub trait Renderer: Send + Sync + 'static {
    /// Whether previews can be rendered for files of `mime_type`.
    fn is_supported(&self, mime_type: &str) -> bool;

    /// Render every specification for `file`.
    ///
    /// Previews that already exist are not an error. The call is one logical
    /// operation, a failure abandons the remaining specifications.
    fn render(
        &self,
        file: &FileNode,
        specifications: &[RenderSpecification],
    ) -> impl Future<Output = Result<(), RenderError>> + Send;
}

/// Directory of accounts.
pub trait AccountDirectory: Send + Sync + 'static {
    /// The account called `id`, if it exists.
    fn get(&self, id: &str) -> impl Future<Output = anyhow::Result<Option<Account>>> + Send;

    /// Whether an account called `id` exists.
    fn exists(&self, id: &str) -> impl Future<Output = anyhow::Result<bool>> + Send {
        async move { Ok(self.get(id).await?.is_some()) }
    }

    /// Every account that has logged in at least once.
    fn known_accounts(&self) -> impl Future<Output = anyhow::Result<Vec<Account>>> + Send;
}

/// Exclusive right to run a queue drain, held by at most one process.
pub trait Lease: Send + Sync {
    /// Take the lease. `false` if somebody else holds it.
    fn try_acquire(&self) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Give the lease back.
    fn release(&self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// The collaborators of a worker, shared by all workers of a run.
#[derive(Debug, Clone)]
pub struct Backend<F, R, A> {
    /// File storage
    pub files: F,
    /// Rendering engine
    pub renderer: R,
    /// Account directory
    pub accounts: A,
}

impl<F, R, A> Backend<F, R, A> {
    /// Bundle the collaborators.
    pub fn new(files: F, renderer: R, accounts: A) -> Self {
        Self {
            files,
            renderer,
            accounts,
        }
    }
}
