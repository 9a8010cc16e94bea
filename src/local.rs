//! Collaborators over a plain directory tree.
//!
//! The tree is laid out as `<root>/<account>/files/...`, every directory
//! directly below the root being an account. Node ids are stable hashes of
//! the virtual path, so renaming a file gives it a new id.

use crate::backend::{
    Account, AccountDirectory, EncryptionState, FileNode, FileTree, NodeKind, Renderer,
    parent_path,
};
use crate::errors::{FileTreeError, RenderError};
use crate::sizes::{RenderSpecification, ScaleMode};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::trace;
use walkdir::WalkDir;
use xxhash_rust::xxh64::xxh64;

const FOLDER_MIME_TYPE: &str = "httpd/unix-directory";
const UNKNOWN_MIME_TYPE: &str = "application/octet-stream";

async fn blocking<T, E>(task: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, E>
where
    T: Send + 'static,
    E: From<anyhow::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| E::from(anyhow::Error::new(e)))?
}

/// Id of the node at a virtual path.
pub fn node_id(path: &str) -> i64 {
    (xxh64(path.as_bytes(), 0) & i64::MAX as u64) as i64
}

fn mime_type_of(path: &Path) -> &'static str {
    ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or(UNKNOWN_MIME_TYPE)
}

fn io_error(path: &str, error: io::Error) -> FileTreeError {
    match error.kind() {
        io::ErrorKind::NotFound => FileTreeError::NotFound(path.to_string()),
        _ => FileTreeError::StorageUnavailable {
            path: path.to_string(),
            reason: error.to_string(),
        },
    }
}

/// [`FileTree`] over a local directory.
///
/// Resolving an id walks the owner's tree once and remembers the path of
/// every node it saw. Later lookups hit that index and only walk again when
/// the id is unknown or its path went stale.
#[derive(Debug, Clone)]
pub struct LocalFileTree {
    root: PathBuf,
    index: Arc<Mutex<HashMap<i64, String>>>,
}

impl LocalFileTree {
    /// A tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Arc::default(),
        }
    }

    /// Physical location of a virtual path.
    pub fn physical_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn virtual_path(&self, physical: &Path) -> Option<String> {
        let relative = physical.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(format!("/{}", parts.join("/")))
    }

    fn node(&self, path: &str) -> Result<FileNode, FileTreeError> {
        let physical = self.physical_path(path);
        let metadata = fs::metadata(&physical).map_err(|e| io_error(path, e))?;
        let path = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        let (kind, mime_type) = if metadata.is_dir() {
            (NodeKind::Folder, FOLDER_MIME_TYPE)
        } else {
            (NodeKind::File, mime_type_of(&physical))
        };

        Ok(FileNode {
            id: node_id(&path),
            path,
            mime_type: mime_type.to_string(),
            kind,
        })
    }

    fn indexed_path(&self, file_id: i64) -> Option<String> {
        let index = self.index.lock().ok()?;
        index.get(&file_id).cloned()
    }

    fn find(&self, owner: &str, file_id: i64) -> Option<FileNode> {
        if let Some(path) = self.indexed_path(file_id) {
            let node = self.node(&path).ok();
            if let Some(node) = node.filter(|node| node.owner() == Some(owner)) {
                return Some(node);
            }
        }

        let paths: Vec<String> = WalkDir::new(self.root.join(owner))
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| self.virtual_path(entry.path()))
            .collect();
        trace!(owner, nodes = paths.len(), "Indexed account tree");

        let found = paths.iter().find(|path| node_id(path) == file_id).cloned();
        if let Ok(mut index) = self.index.lock() {
            index.extend(paths.into_iter().map(|path| (node_id(&path), path)));
        }
        found.and_then(|path| self.node(&path).ok())
    }

    fn children(&self, folder: &str) -> Result<Vec<FileNode>, FileTreeError> {
        let entries = fs::read_dir(self.physical_path(folder)).map_err(|e| io_error(folder, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(folder, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let base = folder.trim_end_matches('/');
        names
            .into_iter()
            .map(|name| self.node(&format!("{base}/{name}")))
            .collect()
    }
}

impl FileTree for LocalFileTree {
    async fn encryption(&self) -> anyhow::Result<EncryptionState> {
        Ok(EncryptionState::Disabled)
    }

    async fn resolve(&self, owner: &str, file_id: i64) -> Result<Option<FileNode>, FileTreeError> {
        let tree = self.clone();
        let owner = owner.to_string();
        blocking(move || Ok(tree.find(&owner, file_id))).await
    }

    async fn get(&self, path: &str) -> Result<FileNode, FileTreeError> {
        let tree = self.clone();
        let path = path.to_string();
        blocking(move || tree.node(&path)).await
    }

    async fn user_folder(&self, owner: &str) -> Result<FileNode, FileTreeError> {
        self.get(&format!("/{owner}/files")).await
    }

    async fn list(&self, folder: &FileNode) -> Result<Vec<FileNode>, FileTreeError> {
        let tree = self.clone();
        let path = folder.path.clone();
        blocking(move || tree.children(&path)).await
    }

    async fn node_exists(&self, folder: &FileNode, name: &str) -> Result<bool, FileTreeError> {
        let physical = self.physical_path(&folder.path).join(name);
        blocking(move || Ok(physical.exists())).await
    }

    async fn parent(&self, node: &FileNode) -> Result<FileNode, FileTreeError> {
        match parent_path(&node.path) {
            Some(parent) => self.get(parent).await,
            None => Err(FileTreeError::NotFound(node.path.clone())),
        }
    }
}

/// Every directory below the root of a [`LocalFileTree`] is an account.
#[derive(Debug, Clone)]
pub struct LocalAccounts {
    root: PathBuf,
}

impl LocalAccounts {
    /// Accounts of the tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AccountDirectory for LocalAccounts {
    async fn get(&self, id: &str) -> anyhow::Result<Option<Account>> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Ok(None);
        }

        let folder = self.root.join(id);
        let exists = blocking::<_, anyhow::Error>(move || Ok(folder.is_dir())).await?;
        Ok(exists.then(|| Account { id: id.to_string() }))
    }

    async fn known_accounts(&self) -> anyhow::Result<Vec<Account>> {
        let root = self.root.clone();
        blocking::<_, anyhow::Error>(move || {
            let mut accounts = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(id) = entry.file_name().to_str() {
                    accounts.push(Account { id: id.to_string() });
                }
            }
            accounts.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(accounts)
        })
        .await
    }
}

/// Size of one rendered preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resize {
    /// Scale and crop to exactly this size
    Crop(u32, u32),
    /// Scale to this size
    Exact(u32, u32),
}

fn scaled(size: u32, ratio: f64) -> u32 {
    ((f64::from(size) * ratio).round() as u32).max(1)
}

/// The resize for `spec` of a `width`x`height` source. Only crops upscale.
fn plan(width: u32, height: u32, spec: &RenderSpecification) -> Resize {
    if spec.crop {
        let size = spec.width.max(1) as u32;
        return Resize::Crop(size, size);
    }

    let x = f64::from(spec.width) / f64::from(width);
    let y = f64::from(spec.height) / f64::from(height);
    let ratio = match (spec.width, spec.height, spec.mode) {
        (-1, _, _) => y,
        (_, -1, _) => x,
        (_, _, Some(ScaleMode::Cover)) => x.max(y),
        _ => x.min(y),
    };

    let ratio = ratio.min(1.0);
    Resize::Exact(scaled(width, ratio), scaled(height, ratio))
}

fn file_name(spec: &RenderSpecification) -> String {
    let variant = match (spec.crop, spec.mode) {
        (true, _) => "crop",
        (false, Some(ScaleMode::Fill)) => "fill",
        (false, Some(ScaleMode::Cover)) => "cover",
        (false, None) => "max",
    };
    format!("{}-{}-{variant}.png", spec.width, spec.height)
}

fn decode_error(path: &str, error: ImageError) -> RenderError {
    match error {
        ImageError::IoError(e) if e.kind() == io::ErrorKind::NotFound => {
            RenderError::NotFound(path.to_string())
        }
        ImageError::Decoding(_) | ImageError::Unsupported(_) | ImageError::Limits(_) => {
            RenderError::InvalidArgument(format!("{path}: {error}"))
        }
        other => RenderError::Failed(format!("{path}: {other}")),
    }
}

/// [`Renderer`] writing PNG previews with the `image` crate.
///
/// Previews of a file are stored as `<preview_root>/<file id>/<w>-<h>-<variant>.png`.
#[derive(Debug, Clone)]
pub struct ImageRenderer {
    tree: LocalFileTree,
    preview_root: PathBuf,
}

impl ImageRenderer {
    /// A renderer reading from `tree` and writing below `preview_root`.
    pub fn new(tree: LocalFileTree, preview_root: impl Into<PathBuf>) -> Self {
        Self {
            tree,
            preview_root: preview_root.into(),
        }
    }

    /// Folder holding the previews of `file_id`.
    pub fn preview_dir(&self, file_id: i64) -> PathBuf {
        self.preview_root.join(file_id.to_string())
    }

    fn render_blocking(
        source: PathBuf,
        virtual_path: &str,
        output: PathBuf,
        specifications: &[RenderSpecification],
    ) -> Result<(), RenderError> {
        let pending: Vec<_> = specifications
            .iter()
            .map(|spec| (spec, output.join(file_name(spec))))
            .filter(|(_, path)| !path.exists())
            .collect();
        if pending.is_empty() {
            trace!(path = virtual_path, "Every preview exists already");
            return Ok(());
        }

        let image = image::open(&source).map_err(|e| decode_error(virtual_path, e))?;
        fs::create_dir_all(&output).map_err(|e| RenderError::Persistence(e.into()))?;

        for (spec, path) in pending {
            let preview = match plan(image.width(), image.height(), spec) {
                Resize::Crop(w, h) => image.resize_to_fill(w, h, FilterType::Lanczos3),
                Resize::Exact(w, h) => image.resize_exact(w, h, FilterType::Lanczos3),
            };
            write_preview(&preview, &path)?;
        }
        Ok(())
    }
}

/// Encode `preview` next to `path` and move it into place once complete.
///
/// A failed write never leaves a file at `path`, and the temporary file is
/// removed when it is dropped.
fn write_preview(preview: &DynamicImage, path: &Path) -> Result<(), RenderError> {
    let persistence = |e: io::Error| RenderError::Persistence(e.into());
    let dir = path.parent().unwrap_or(Path::new("."));

    let mut temp = tempfile::Builder::new()
        .prefix(".preview-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(persistence)?;

    let mut writer = BufWriter::new(temp.as_file_mut());
    preview
        .write_to(&mut writer, ImageFormat::Png)
        .map_err(|e| RenderError::Persistence(e.into()))?;
    writer.flush().map_err(persistence)?;
    drop(writer);

    match temp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            Err(RenderError::DuplicateArtifact(path.display().to_string()))
        }
        Err(e) => Err(persistence(e.error)),
    }
}

impl Renderer for ImageRenderer {
    fn is_supported(&self, mime_type: &str) -> bool {
        ImageFormat::from_mime_type(mime_type).is_some_and(|format| format.reading_enabled())
    }

    async fn render(
        &self,
        file: &FileNode,
        specifications: &[RenderSpecification],
    ) -> Result<(), RenderError> {
        let source = self.tree.physical_path(&file.path);
        let output = self.preview_dir(file.id);
        let virtual_path = file.path.clone();
        let specifications = specifications.to_vec();

        tokio::task::spawn_blocking(move || {
            Self::render_blocking(source, &virtual_path, output, &specifications)
        })
        .await
        .map_err(|e| RenderError::Failed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizes::{SizeOverrides, generate_specifications};
    use claims::{assert_matches, assert_none, assert_ok, assert_some};
    use image::RgbImage;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let photos = dir.path().join("alice/files/Photos");
        fs::create_dir_all(&photos).unwrap();
        fs::create_dir_all(dir.path().join("bob/files")).unwrap();
        RgbImage::new(400, 200).save(photos.join("wide.png")).unwrap();
        fs::write(photos.join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("alice/files/broken.png"), "not a png").unwrap();
        dir
    }

    fn spec(width: i32, height: i32, crop: bool, mode: Option<ScaleMode>) -> RenderSpecification {
        RenderSpecification {
            width,
            height,
            crop,
            mode,
        }
    }

    #[test]
    fn resize_plans() {
        assert_eq!(plan(400, 200, &spec(64, 64, true, None)), Resize::Crop(64, 64));
        assert_eq!(
            plan(400, 200, &spec(256, 256, false, Some(ScaleMode::Fill))),
            Resize::Exact(256, 128)
        );
        assert_eq!(
            plan(400, 200, &spec(64, 64, false, Some(ScaleMode::Cover))),
            Resize::Exact(128, 64)
        );
        assert_eq!(plan(400, 200, &spec(64, -1, false, None)), Resize::Exact(64, 32));
        assert_eq!(plan(400, 200, &spec(-1, 64, false, None)), Resize::Exact(128, 64));
        // no upscaling
        assert_eq!(
            plan(400, 200, &spec(4096, -1, false, None)),
            Resize::Exact(400, 200)
        );
    }

    #[tokio::test]
    async fn navigates_the_tree() {
        let dir = tree();
        let files = LocalFileTree::new(dir.path());

        let folder = assert_ok!(files.user_folder("alice").await);
        assert_eq!(folder.path, "/alice/files");
        assert_eq!(folder.kind, NodeKind::Folder);

        let photos = assert_ok!(files.get("/alice/files/Photos").await);
        let children = assert_ok!(files.list(&photos).await);
        let names: Vec<_> = children.iter().map(FileNode::name).collect();
        assert_eq!(names, ["notes.txt", "wide.png"]);
        assert_eq!(children[1].mime_type, "image/png");
        assert_eq!(children[1].id, node_id("/alice/files/Photos/wide.png"));

        let mut node = children[1].clone();
        let mut ancestors = Vec::new();
        loop {
            match files.parent(&node).await {
                Ok(parent) => {
                    ancestors.push(parent.path.clone());
                    node = parent;
                }
                Err(error) => {
                    assert_matches!(error, FileTreeError::NotFound(_));
                    break;
                }
            }
        }
        assert_eq!(ancestors, ["/alice/files/Photos", "/alice/files", "/alice", "/"]);

        assert!(assert_ok!(files.node_exists(&photos, "wide.png").await));
        assert!(!assert_ok!(files.node_exists(&photos, ".nomedia").await));
        assert_matches!(
            files.get("/alice/files/missing.png").await,
            Err(FileTreeError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn resolves_ids_within_the_owner() {
        let dir = tree();
        let files = LocalFileTree::new(dir.path());
        let id = node_id("/alice/files/Photos/wide.png");

        let node = assert_some!(assert_ok!(files.resolve("alice", id).await));
        assert_eq!(node.path, "/alice/files/Photos/wide.png");
        assert_none!(assert_ok!(files.resolve("bob", id).await));
        assert_none!(assert_ok!(files.resolve("alice", 42).await));
    }

    #[tokio::test]
    async fn accounts_are_top_level_directories() {
        let dir = tree();
        fs::write(dir.path().join("README"), "").unwrap();
        let accounts = LocalAccounts::new(dir.path());

        let known = assert_ok!(accounts.known_accounts().await);
        let ids: Vec<_> = known.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["alice", "bob"]);

        assert_some!(assert_ok!(accounts.get("alice").await));
        assert_none!(assert_ok!(accounts.get("carol").await));
        assert_none!(assert_ok!(accounts.get("../alice").await));
        assert_none!(assert_ok!(accounts.get("README").await));
    }

    #[tokio::test]
    async fn renders_missing_previews_only() {
        let dir = tree();
        let previews = tempfile::tempdir().unwrap();
        let files = LocalFileTree::new(dir.path());
        let renderer = ImageRenderer::new(files.clone(), previews.path());

        assert!(renderer.is_supported("image/png"));
        assert!(!renderer.is_supported("text/plain"));

        let file = assert_ok!(files.get("/alice/files/Photos/wide.png").await);
        let specifications = generate_specifications(256, 256, &SizeOverrides::default());
        assert_ok!(renderer.render(&file, &specifications).await);

        let output = renderer.preview_dir(file.id);
        let mut written: Vec<_> = fs::read_dir(&output)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        written.sort();
        assert_eq!(
            written,
            [
                "-1-256-max.png",
                "-1-64-max.png",
                "256--1-max.png",
                "256-256-crop.png",
                "256-256-fill.png",
                "64--1-max.png",
                "64-64-crop.png",
                "64-64-fill.png",
            ]
        );

        let crop = image::open(output.join("64-64-crop.png")).unwrap();
        assert_eq!((crop.width(), crop.height()), (64, 64));
        let fill = image::open(output.join("256-256-fill.png")).unwrap();
        assert_eq!((fill.width(), fill.height()), (256, 128));

        // existing previews are kept
        assert_ok!(renderer.render(&file, &specifications).await);
    }

    #[tokio::test]
    async fn classifies_render_failures() {
        let dir = tree();
        let previews = tempfile::tempdir().unwrap();
        let files = LocalFileTree::new(dir.path());
        let renderer = ImageRenderer::new(files.clone(), previews.path());
        let specifications = [spec(64, 64, true, None)];

        let broken = assert_ok!(files.get("/alice/files/broken.png").await);
        assert_matches!(
            renderer.render(&broken, &specifications).await,
            Err(RenderError::InvalidArgument(_))
        );

        let mut gone = broken.clone();
        gone.path = "/alice/files/gone.png".into();
        gone.id = node_id(&gone.path);
        assert_matches!(
            renderer.render(&gone, &specifications).await,
            Err(RenderError::NotFound(_))
        );
    }

    #[test]
    fn concurrent_writes_are_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("64-64-crop.png");
        let preview = DynamicImage::new_rgb8(4, 4);

        assert_ok!(write_preview(&preview, &path));
        assert_matches!(
            write_preview(&preview, &path),
            Err(RenderError::DuplicateArtifact(_))
        );

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["64-64-crop.png"]);
        assert_eq!(image::open(&path).unwrap().width(), 4);
    }

    #[test]
    fn failed_writes_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let preview = DynamicImage::new_rgb8(4, 4);

        let missing = dir.path().join("gone/64-64-crop.png");
        assert_matches!(
            write_preview(&preview, &missing),
            Err(RenderError::Persistence(_))
        );

        // a directory squatting on the target is never replaced
        let taken = dir.path().join("64-64-crop.png");
        fs::create_dir(&taken).unwrap();
        assert_matches!(
            write_preview(&preview, &taken),
            Err(RenderError::DuplicateArtifact(_))
        );
        assert!(taken.is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn resolve_follows_tree_changes() {
        let dir = tree();
        let files = LocalFileTree::new(dir.path());
        let wide = node_id("/alice/files/Photos/wide.png");
        assert_some!(assert_ok!(files.resolve("alice", wide).await));

        // unknown ids walk the tree again
        fs::write(dir.path().join("alice/files/new.txt"), "fresh").unwrap();
        let id = node_id("/alice/files/new.txt");
        let node = assert_some!(assert_ok!(files.resolve("alice", id).await));
        assert_eq!(node.path, "/alice/files/new.txt");

        // indexed paths that vanished are not served
        fs::remove_file(dir.path().join("alice/files/Photos/wide.png")).unwrap();
        assert_none!(assert_ok!(files.resolve("alice", wide).await));
        assert_none!(assert_ok!(files.resolve("bob", id).await));
    }
}
