#![allow(dead_code)]

use anyhow::anyhow;
use previews::sizes::RenderSpecification;
use previews::{
    Account, AccountDirectory, Backend, EncryptionState, FileNode, FileTree, FileTreeError,
    NodeKind, RenderError, Renderer, parent_path, setup_database,
};
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

pub type TestBackend = Backend<MemoryTree, RecordingRenderer, MemoryAccounts>;

/// Set up a test database with `TestContainers` and return the pool and container
pub async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
    let postgres_image = Postgres::default();
    let container = postgres_image.start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    setup_database(&pool).await?;

    Ok((pool, container))
}

pub fn backend(
    tree: MemoryTree,
    renderer: RecordingRenderer,
    accounts: MemoryAccounts,
) -> Arc<TestBackend> {
    Arc::new(Backend::new(tree, renderer, accounts))
}

fn mime_for(path: &str) -> &'static str {
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".jpg") {
        "image/jpeg"
    } else {
        "text/plain"
    }
}

fn child_path(folder: &str, name: &str) -> String {
    if folder == "/" {
        format!("/{name}")
    } else {
        format!("{folder}/{name}")
    }
}

/// File tree held in memory. Folders get negative ids so they never collide
/// with the file ids chosen by a test.
#[derive(Debug, Clone)]
pub struct MemoryTree {
    nodes: BTreeMap<String, FileNode>,
    encryption: EncryptionState,
    unavailable: Vec<String>,
    no_preview_mounts: Vec<String>,
    next_folder_id: i64,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    pub fn new() -> Self {
        let mut tree = Self {
            nodes: BTreeMap::new(),
            encryption: EncryptionState::Disabled,
            unavailable: Vec::new(),
            no_preview_mounts: Vec::new(),
            next_folder_id: 0,
        };
        tree.insert_folder("/");
        tree
    }

    fn insert_folder(&mut self, path: &str) {
        if self.nodes.contains_key(path) {
            return;
        }
        if let Some(parent) = parent_path(path) {
            self.insert_folder(parent);
        }

        self.next_folder_id -= 1;
        self.nodes.insert(
            path.to_string(),
            FileNode {
                id: self.next_folder_id,
                path: path.to_string(),
                mime_type: "httpd/unix-directory".to_string(),
                kind: NodeKind::Folder,
            },
        );
    }

    pub fn file(self, path: &str, id: i64) -> Self {
        self.file_with_mime(path, id, mime_for(path))
    }

    pub fn file_with_mime(mut self, path: &str, id: i64, mime_type: &str) -> Self {
        if let Some(parent) = parent_path(path) {
            self.insert_folder(parent);
        }
        self.nodes.insert(
            path.to_string(),
            FileNode {
                id,
                path: path.to_string(),
                mime_type: mime_type.to_string(),
                kind: NodeKind::File,
            },
        );
        self
    }

    pub fn folder(mut self, path: &str) -> Self {
        self.insert_folder(path);
        self
    }

    pub fn with_encryption(mut self, state: EncryptionState) -> Self {
        self.encryption = state;
        self
    }

    /// Listing `path` fails as if its storage was offline.
    pub fn unavailable(mut self, path: &str) -> Self {
        self.unavailable.push(path.to_string());
        self
    }

    pub fn no_preview_mount(mut self, path: &str) -> Self {
        self.no_preview_mounts.push(path.to_string());
        self
    }

    pub fn node(&self, path: &str) -> FileNode {
        self.nodes[path].clone()
    }

    fn lookup(&self, path: &str) -> Result<FileNode, FileTreeError> {
        self.nodes
            .get(path)
            .cloned()
            .ok_or_else(|| FileTreeError::NotFound(path.to_string()))
    }
}

impl FileTree for MemoryTree {
    async fn encryption(&self) -> anyhow::Result<EncryptionState> {
        Ok(self.encryption)
    }

    async fn resolve(&self, owner: &str, file_id: i64) -> Result<Option<FileNode>, FileTreeError> {
        Ok(self
            .nodes
            .values()
            .find(|node| node.id == file_id && node.owner() == Some(owner))
            .cloned())
    }

    async fn get(&self, path: &str) -> Result<FileNode, FileTreeError> {
        self.lookup(path)
    }

    async fn user_folder(&self, owner: &str) -> Result<FileNode, FileTreeError> {
        self.lookup(&format!("/{owner}/files"))
    }

    async fn list(&self, folder: &FileNode) -> Result<Vec<FileNode>, FileTreeError> {
        if self.unavailable.contains(&folder.path) {
            return Err(FileTreeError::StorageUnavailable {
                path: folder.path.clone(),
                reason: "mount is offline".to_string(),
            });
        }

        Ok(self
            .nodes
            .values()
            .filter(|node| node.path != "/" && parent_path(&node.path) == Some(folder.path.as_str()))
            .cloned()
            .collect())
    }

    async fn node_exists(&self, folder: &FileNode, name: &str) -> Result<bool, FileTreeError> {
        Ok(self.nodes.contains_key(&child_path(&folder.path, name)))
    }

    async fn parent(&self, node: &FileNode) -> Result<FileNode, FileTreeError> {
        match parent_path(&node.path) {
            Some(parent) => self.lookup(parent),
            None => Err(FileTreeError::NotFound(node.path.clone())),
        }
    }

    async fn no_preview_mounts(&self, owner: &str) -> Result<Vec<String>, FileTreeError> {
        let prefix = format!("/{owner}/");
        Ok(self
            .no_preview_mounts
            .iter()
            .filter(|mount| mount.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

/// How [`RecordingRenderer`] fails for a file.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    NotFound,
    InvalidArgument,
    Failed,
    Duplicate,
    Persistence,
    Panic,
}

/// Renders nothing, but remembers which files it was asked to render.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    failures: HashMap<i64, Failure>,
    calls: Mutex<Vec<i64>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, file_id: i64, failure: Failure) -> Self {
        self.failures.insert(file_id, failure);
        self
    }

    /// File ids in the order they were rendered.
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sorted_calls(&self) -> Vec<i64> {
        let mut calls = self.calls();
        calls.sort_unstable();
        calls
    }
}

impl Renderer for RecordingRenderer {
    fn is_supported(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/")
    }

    async fn render(
        &self,
        file: &FileNode,
        _specifications: &[RenderSpecification],
    ) -> Result<(), RenderError> {
        self.calls.lock().unwrap().push(file.id);

        match self.failures.get(&file.id) {
            None => Ok(()),
            Some(Failure::NotFound) => Err(RenderError::NotFound(file.path.clone())),
            Some(Failure::InvalidArgument) => {
                Err(RenderError::InvalidArgument("zero sized image".into()))
            }
            Some(Failure::Failed) => Err(RenderError::Failed("decoder crashed".into())),
            Some(Failure::Duplicate) => Err(RenderError::DuplicateArtifact(file.path.clone())),
            Some(Failure::Persistence) => Err(RenderError::Persistence(anyhow!("disk full"))),
            Some(Failure::Panic) => panic!("renderer exploded"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAccounts {
    ids: BTreeSet<String>,
}

impl MemoryAccounts {
    pub fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

impl AccountDirectory for MemoryAccounts {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Account>> {
        Ok(self.ids.contains(id).then(|| Account { id: id.to_string() }))
    }

    async fn known_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self
            .ids
            .iter()
            .map(|id| Account { id: id.clone() })
            .collect())
    }
}
