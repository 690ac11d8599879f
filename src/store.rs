//! Storage abstraction over the versioned object store.
//!
//! The [`FileStore`] trait defines the narrow contract the indexing layers
//! need from a backing store: path resolution, byte streams, directory
//! listing, and a change-notification stream. The store's own consistency
//! model (commits, branches, diffing) stays behind this seam.
//!
//! [`DiskStore`] is the reference backend over a local directory; its change
//! stream is fed by a `notify` watcher translated into [`ChangeEvent`]s.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};

use chrono::{DateTime, TimeZone, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A location within a named store.
///
/// Immutable value created by [`FileStore::resolve`]; never constructed by
/// the index layers directly. The `uri()` form (`"store:/a/b"`) is the
/// natural key of the path's index document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    store: String,
    rel: PathBuf,
}

impl StorePath {
    fn new(store: &str, rel: PathBuf) -> Self {
        Self {
            store: store.to_string(),
            rel,
        }
    }

    /// Name of the store this path belongs to.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Path relative to the store root.
    pub fn rel(&self) -> &Path {
        &self.rel
    }

    pub fn file_name(&self) -> Option<&str> {
        self.rel.file_name().and_then(|n| n.to_str())
    }

    pub fn parent(&self) -> Option<StorePath> {
        self.rel
            .parent()
            .map(|p| StorePath::new(&self.store, p.to_path_buf()))
    }

    /// Resolve `name` against this path's parent directory.
    pub fn sibling(&self, name: &str) -> StorePath {
        let parent = self.rel.parent().unwrap_or_else(|| Path::new(""));
        StorePath::new(&self.store, parent.join(name))
    }

    pub fn join(&self, name: &str) -> StorePath {
        StorePath::new(&self.store, self.rel.join(name))
    }

    /// Natural key form: `"<store>:/<rel>"` with forward slashes.
    pub fn uri(&self) -> String {
        let mut rel = String::new();
        for comp in self.rel.components() {
            rel.push('/');
            rel.push_str(&comp.as_os_str().to_string_lossy());
        }
        if rel.is_empty() {
            rel.push('/');
        }
        format!("{}:{}", self.store, rel)
    }

    /// Whether the final component is a dot-prefixed (hidden) name.
    /// Sidecar records are hidden by construction and must never be indexed.
    pub fn is_hidden(&self) -> bool {
        self.file_name().map(|n| n.starts_with('.')).unwrap_or(false)
    }
}

/// Kind of store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata the store exposes for one entry.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl EntryMeta {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One externally observed change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: StorePath,
    /// Destination path; present only for [`ChangeKind::Renamed`].
    pub new_path: Option<StorePath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// The versioned object store, reduced to what indexing needs.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`resolve`](FileStore::resolve) | Turn a raw string into a [`StorePath`] |
/// | [`read`](FileStore::read) / [`write`](FileStore::write) | Byte-stream access |
/// | [`remove`](FileStore::remove) | Delete one entry |
/// | [`create_dir`](FileStore::create_dir) | Create one directory level |
/// | [`read_dir`](FileStore::read_dir) | List direct children |
/// | [`metadata`](FileStore::metadata) | Entry kind, size, timestamps |
/// | [`watch`](FileStore::watch) | Change-notification stream |
/// | [`close`](FileStore::close) | Release watchers, disconnect streams |
pub trait FileStore: Send + Sync {
    fn name(&self) -> &str;

    /// Path-resolution function of the store. Normalizes separators and
    /// collapses `.`/`..` components; never escapes the store root.
    fn resolve(&self, raw: &str) -> StorePath;

    fn exists(&self, path: &StorePath) -> bool;

    fn metadata(&self, path: &StorePath) -> Result<EntryMeta>;

    fn read(&self, path: &StorePath) -> Result<Vec<u8>>;

    /// Create or replace the entry at `path`. The parent must exist.
    fn write(&self, path: &StorePath, bytes: &[u8]) -> Result<()>;

    /// Remove one entry. Directories must be empty.
    fn remove(&self, path: &StorePath) -> Result<()>;

    fn create_dir(&self, path: &StorePath) -> Result<()>;

    fn read_dir(&self, path: &StorePath) -> Result<Vec<StorePath>>;

    /// Subscribe to changes anywhere under the store root. Each received
    /// batch holds one or more events. The stream disconnects when the
    /// store is closed.
    fn watch(&self) -> Result<Receiver<Vec<ChangeEvent>>>;

    /// Whether the store has been closed.
    fn is_closed(&self) -> bool;

    /// Stop watchers and disconnect all change streams.
    fn close(&self);
}

/// Local-filesystem store backend.
pub struct DiskStore {
    name: String,
    root: PathBuf,
    watchers: Mutex<Vec<RecommendedWatcher>>,
    closed: AtomicBool,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the root directory if needed.
    pub fn open(name: &str, root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| Error::from_io(e, &root.display().to_string()))?;
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            watchers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn os_path(&self, path: &StorePath) -> PathBuf {
        self.root.join(path.rel())
    }
}

fn system_time_to_utc(t: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    let secs = t
        .ok()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Utc.timestamp_opt(secs, 0).single()
}

impl FileStore for DiskStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, raw: &str) -> StorePath {
        let mut rel = PathBuf::new();
        for comp in Path::new(raw).components() {
            match comp {
                Component::Normal(c) => rel.push(c),
                Component::ParentDir => {
                    rel.pop();
                }
                _ => {}
            }
        }
        StorePath::new(&self.name, rel)
    }

    fn exists(&self, path: &StorePath) -> bool {
        self.os_path(path).exists()
    }

    fn metadata(&self, path: &StorePath) -> Result<EntryMeta> {
        let meta =
            std::fs::metadata(self.os_path(path)).map_err(|e| Error::from_io(e, &path.uri()))?;
        Ok(EntryMeta {
            kind: if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: meta.len(),
            modified: system_time_to_utc(meta.modified()),
            created: system_time_to_utc(meta.created()),
        })
    }

    fn read(&self, path: &StorePath) -> Result<Vec<u8>> {
        std::fs::read(self.os_path(path)).map_err(|e| Error::from_io(e, &path.uri()))
    }

    fn write(&self, path: &StorePath, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.os_path(path), bytes).map_err(|e| Error::from_io(e, &path.uri()))
    }

    fn remove(&self, path: &StorePath) -> Result<()> {
        let os = self.os_path(path);
        let meta = std::fs::metadata(&os).map_err(|e| Error::from_io(e, &path.uri()))?;
        if meta.is_dir() {
            let mut entries =
                std::fs::read_dir(&os).map_err(|e| Error::from_io(e, &path.uri()))?;
            if entries.next().is_some() {
                return Err(Error::DirectoryNotEmpty(path.uri()));
            }
            std::fs::remove_dir(&os).map_err(|e| Error::from_io(e, &path.uri()))
        } else {
            std::fs::remove_file(&os).map_err(|e| Error::from_io(e, &path.uri()))
        }
    }

    fn create_dir(&self, path: &StorePath) -> Result<()> {
        std::fs::create_dir(self.os_path(path)).map_err(|e| Error::from_io(e, &path.uri()))
    }

    fn read_dir(&self, path: &StorePath) -> Result<Vec<StorePath>> {
        let os = self.os_path(path);
        let mut children = Vec::new();
        for entry in std::fs::read_dir(&os).map_err(|e| Error::from_io(e, &path.uri()))? {
            let entry = entry.map_err(Error::Backend)?;
            if let Some(name) = entry.file_name().to_str() {
                children.push(path.join(name));
            }
        }
        children.sort_by(|a, b| a.uri().cmp(&b.uri()));
        Ok(children)
    }

    fn watch(&self) -> Result<Receiver<Vec<ChangeEvent>>> {
        if self.is_closed() {
            return Err(Error::Unsupported(format!(
                "store {} is closed",
                self.name
            )));
        }
        let (tx, rx) = channel::<Vec<ChangeEvent>>();
        let root = self.root.clone();
        let store = self.name.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let batch = translate_event(&store, &root, &event);
                    if !batch.is_empty() {
                        // Receiver gone means the stream was dropped; stop forwarding.
                        let _ = tx.send(batch);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "change watcher error");
                }
            }
        })
        .map_err(|e| Error::Unsupported(format!("cannot watch store: {e}")))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| Error::Unsupported(format!("cannot watch store: {e}")))?;

        self.watchers.lock().push(watcher);
        Ok(rx)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the notify watchers drops their senders, which
        // disconnects every change stream handed out by watch().
        self.watchers.lock().clear();
    }
}

fn translate_event(store: &str, root: &Path, event: &notify::Event) -> Vec<ChangeEvent> {
    use notify::event::{EventKind, ModifyKind, RenameMode};

    let to_store_path = |os: &PathBuf| -> Option<StorePath> {
        let rel = os.strip_prefix(root).ok()?;
        Some(StorePath::new(store, rel.to_path_buf()))
    };

    let mut out = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            for p in &event.paths {
                if let Some(path) = to_store_path(p) {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Created,
                        path,
                        new_path: None,
                    });
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() == 2 {
                if let (Some(from), Some(to)) =
                    (to_store_path(&event.paths[0]), to_store_path(&event.paths[1]))
                {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Renamed,
                        path: from,
                        new_path: Some(to),
                    });
                }
            }
        }
        // Unpaired rename halves degrade to delete/create.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for p in &event.paths {
                if let Some(path) = to_store_path(p) {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Deleted,
                        path,
                        new_path: None,
                    });
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for p in &event.paths {
                if let Some(path) = to_store_path(p) {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Created,
                        path,
                        new_path: None,
                    });
                }
            }
        }
        EventKind::Modify(_) => {
            for p in &event.paths {
                if let Some(path) = to_store_path(p) {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Modified,
                        path,
                        new_path: None,
                    });
                }
            }
        }
        EventKind::Remove(_) => {
            for p in &event.paths {
                if let Some(path) = to_store_path(p) {
                    out.push(ChangeEvent {
                        kind: ChangeKind::Deleted,
                        path,
                        new_path: None,
                    });
                }
            }
        }
        _ => {}
    }
    out
}
