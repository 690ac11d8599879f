//! Attribute-aware IO over mounted stores.
//!
//! [`IoService`] is the operation surface the rest of the crate goes
//! through: byte-stream access, structural operations, and extended
//! attributes persisted in each path's sidecar record. Stores are mounted by
//! name; a [`StorePath`] is routed to its owning store through that registry.
//!
//! Attribute views are materialized lazily and held in a per-path cache so
//! repeated reads between mutations reuse the computed values. Every
//! mutation of a path invalidates its cache entry.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::attrs::{
    indexed_name, split_indexed, AttrMap, AttrStore, AttributeView, PropertyValue, VersionView,
    ViewKind,
};
use crate::error::{Error, Result};
use crate::sidecar;
use crate::store::{ChangeEvent, EntryMeta, FileStore, StorePath};

/// Commit information carried by a write. When author or comment is present
/// the write appends one entry to the path's version history.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub author: Option<String>,
    pub comment: Option<String>,
}

impl WriteOptions {
    pub fn commented(author: &str, comment: &str) -> Self {
        Self {
            author: Some(author.to_string()),
            comment: Some(comment.to_string()),
        }
    }

    fn is_versioned(&self) -> bool {
        self.author.is_some() || self.comment.is_some()
    }
}

/// Attribute-aware IO service over mounted stores.
#[derive(Default)]
pub struct IoService {
    stores: RwLock<HashMap<String, Arc<dyn FileStore>>>,
    attr_cache: Mutex<HashMap<String, AttrStore>>,
}

impl IoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its own name. Mounting two stores with the
    /// same name is an error.
    pub fn mount(&self, store: Arc<dyn FileStore>) -> Result<()> {
        let mut stores = self.stores.write();
        let name = store.name().to_string();
        if stores.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        stores.insert(name, store);
        Ok(())
    }

    pub fn unmount(&self, name: &str) -> Option<Arc<dyn FileStore>> {
        self.stores.write().remove(name)
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn FileStore>> {
        self.stores.read().get(name).cloned()
    }

    fn store_of(&self, path: &StorePath) -> Result<Arc<dyn FileStore>> {
        self.store(path.store())
            .ok_or_else(|| Error::NotFound(format!("store {} is not mounted", path.store())))
    }

    pub(crate) fn invalidate(&self, path: &StorePath) {
        self.attr_cache.lock().remove(&path.uri());
    }

    // ---- byte and structural operations ------------------------------------

    pub fn exists(&self, path: &StorePath) -> bool {
        self.store_of(path)
            .map(|s| s.exists(path))
            .unwrap_or(false)
    }

    pub fn metadata(&self, path: &StorePath) -> Result<EntryMeta> {
        self.store_of(path)?.metadata(path)
    }

    pub fn read(&self, path: &StorePath) -> Result<Vec<u8>> {
        self.store_of(path)?.read(path)
    }

    pub fn read_to_string(&self, path: &StorePath) -> Result<String> {
        String::from_utf8(self.read(path)?)
            .map_err(|_| Error::InvalidArgument(format!("{} is not UTF-8", path.uri())))
    }

    /// Create an empty file. The path must not already exist.
    pub fn create_file(&self, path: &StorePath, options: &WriteOptions) -> Result<()> {
        if self.exists(path) {
            return Err(Error::AlreadyExists(path.uri()));
        }
        self.write(path, b"", options)
    }

    /// Create one directory level. The path must not already exist.
    pub fn create_directory(&self, path: &StorePath) -> Result<()> {
        let store = self.store_of(path)?;
        if store.exists(path) {
            return Err(Error::AlreadyExists(path.uri()));
        }
        store.create_dir(path)?;
        self.invalidate(path);
        Ok(())
    }

    /// Create the directory and every missing ancestor. Existing levels are
    /// fine; an existing leaf is not.
    pub fn create_directories(&self, path: &StorePath) -> Result<()> {
        let store = self.store_of(path)?;
        if store.exists(path) {
            return Err(Error::AlreadyExists(path.uri()));
        }
        let mut chain = vec![path.clone()];
        let mut cursor = path.parent();
        while let Some(parent) = cursor {
            if parent.file_name().is_none() || store.exists(&parent) {
                break;
            }
            cursor = parent.parent();
            chain.push(parent);
        }
        for level in chain.into_iter().rev() {
            store.create_dir(&level)?;
        }
        self.invalidate(path);
        Ok(())
    }

    /// Write `bytes` to `path`, creating or replacing it. Commit information
    /// in `options` appends one version-history entry to the sidecar.
    pub fn write(&self, path: &StorePath, bytes: &[u8], options: &WriteOptions) -> Result<()> {
        let store = self.store_of(path)?;
        store.write(path, bytes)?;
        if options.is_versioned() && !sidecar::is_sidecar(path) {
            self.append_version(store.as_ref(), path, options)?;
        }
        self.invalidate(path);
        Ok(())
    }

    fn append_version(
        &self,
        store: &dyn FileStore,
        path: &StorePath,
        options: &WriteOptions,
    ) -> Result<()> {
        let mut content = sidecar::load(store, path)?;
        let slot = VersionView::new(&content).history_len();
        if let Some(author) = &options.author {
            content.insert(indexed_name("version.author", slot), author.clone());
        }
        if let Some(comment) = &options.comment {
            content.insert(indexed_name("version.comment", slot), comment.clone());
        }
        content.insert(
            indexed_name("version.date", slot),
            Utc::now().to_rfc3339(),
        );
        sidecar::save(store, path, &content)
    }

    /// Buffered write handle. Nothing reaches the store until `close`.
    pub fn open_channel(&self, path: &StorePath, options: WriteOptions) -> Result<FileChannel<'_>> {
        self.store_of(path)?;
        Ok(FileChannel {
            io: self,
            path: path.clone(),
            options,
            buffer: Vec::new(),
            closed: false,
        })
    }

    /// Copy a file's bytes and its sidecar record. The target must not
    /// already exist. Directory copies are shallow and therefore only
    /// accepted for empty directories; the check runs before anything is
    /// mutated, so a rejected copy leaves no partial target behind.
    pub fn copy(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        let src = self.store_of(from)?;
        let dst = self.store_of(to)?;
        if dst.exists(to) {
            return Err(Error::AlreadyExists(to.uri()));
        }
        let meta = src.metadata(from)?;
        if meta.is_dir() {
            if !src.read_dir(from)?.is_empty() {
                return Err(Error::Unsupported(format!(
                    "cannot copy non-empty directory {}",
                    from.uri()
                )));
            }
            dst.create_dir(to)?;
        } else {
            dst.write(to, &src.read(from)?)?;
        }
        let content = sidecar::load(src.as_ref(), from)?;
        if !content.is_empty() {
            sidecar::save(dst.as_ref(), to, &content)?;
        }
        self.invalidate(to);
        Ok(())
    }

    /// Move a path: bytes and sidecar record travel, the source disappears.
    /// The target must not already exist.
    pub fn rename(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        self.copy(from, to)?;
        let src = self.store_of(from)?;
        // Primary first: a failed remove must leave the source's sidecar
        // record in place alongside its bytes.
        src.remove(from)?;
        sidecar::remove_best_effort(src.as_ref(), from);
        self.invalidate(from);
        Ok(())
    }

    /// Delete a path and its sidecar record. Directories must be empty
    /// (an orphaned sidecar child does not count as content).
    pub fn delete(&self, path: &StorePath) -> Result<()> {
        let store = self.store_of(path)?;
        let meta = store.metadata(path)?;
        if meta.is_dir() {
            let only_sidecars = store
                .read_dir(path)?
                .into_iter()
                .all(|child| sidecar::is_sidecar(&child));
            if only_sidecars {
                for child in store.read_dir(path)? {
                    store.remove(&child)?;
                }
            }
        }
        store.remove(path)?;
        sidecar::remove_best_effort(store.as_ref(), path);
        self.invalidate(path);
        Ok(())
    }

    /// Delete if present; reports whether anything was removed.
    pub fn delete_if_exists(&self, path: &StorePath) -> Result<bool> {
        match self.delete(path) {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    pub fn watch(&self, store_name: &str) -> Result<Receiver<Vec<ChangeEvent>>> {
        self.store(store_name)
            .ok_or_else(|| Error::NotFound(format!("store {store_name} is not mounted")))?
            .watch()
    }

    // ---- extended attributes ----------------------------------------------

    /// The view registered under `tag` for `path`, building and caching it
    /// on first access. Unknown tags are an error; missing paths too.
    pub fn get_attribute_view(&self, path: &StorePath, tag: &str) -> Result<Arc<dyn AttributeView>> {
        if let Some(view) = self
            .attr_cache
            .lock()
            .get(&path.uri())
            .and_then(|store| store.get_view(tag))
        {
            return Ok(view);
        }
        let kind = ViewKind::from_tag(tag)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown attribute view {tag:?}")))?;
        let store = self.store_of(path)?;
        let meta = store.metadata(path)?;
        let content = sidecar::load(store.as_ref(), path)?;
        let view = kind.build(&meta, &content);
        self.attr_cache
            .lock()
            .entry(path.uri())
            .or_default()
            .add_view(view.clone());
        Ok(view)
    }

    /// Every view's attributes for `path`, namespaced `tag.name`.
    pub fn read_all_attributes(&self, path: &StorePath) -> Result<AttrMap> {
        let mut out = AttrMap::new();
        for kind in ViewKind::ALL {
            let view = self.get_attribute_view(path, kind.tag())?;
            for (name, value) in view.attributes() {
                out.insert(format!("{}.{name}", view.name()), value.clone());
            }
        }
        Ok(out)
    }

    /// Read by selector: `"*"` for everything, `"tag.*"` for one view,
    /// `"tag.name"` for one property (all repeats). A bare name addresses
    /// the basic view.
    pub fn read_attributes(&self, path: &StorePath, selector: &str) -> Result<AttrMap> {
        if selector == "*" {
            return self.read_all_attributes(path);
        }
        let (tag, local) = selector.split_once('.').unwrap_or(("basic", selector));
        let view = self.get_attribute_view(path, tag)?;
        let subset = view.read_named(&[local]);
        Ok(subset
            .into_iter()
            .map(|(name, value)| (format!("{tag}.{name}"), value))
            .collect())
    }

    /// Write one attribute through its view. The view must be recognized,
    /// writable, and must support the attribute's base name.
    pub fn set_attribute(&self, path: &StorePath, name: &str, value: PropertyValue) -> Result<()> {
        let (tag, local) = name.split_once('.').unwrap_or(("basic", name));
        let view = self.get_attribute_view(path, tag)?;
        if !view.writable() {
            return Err(Error::Unsupported(format!(
                "attribute view {tag:?} is read-only"
            )));
        }
        if !view.supports(local) {
            return Err(Error::Unsupported(format!(
                "view {tag:?} has no attribute {:?}",
                split_indexed(local).0
            )));
        }
        let store = self.store_of(path)?;
        let mut content = sidecar::load(store.as_ref(), path)?;
        content.insert(format!("{tag}.{local}"), value.render());
        sidecar::save(store.as_ref(), path, &content)?;
        self.invalidate(path);
        Ok(())
    }

    /// Bulk form of [`set_attribute`](Self::set_attribute); names carry the
    /// same `tag.name` addressing.
    pub fn set_attributes(&self, path: &StorePath, attrs: &AttrMap) -> Result<()> {
        for (name, value) in attrs {
            self.set_attribute(path, name, value.clone())?;
        }
        Ok(())
    }
}

/// Buffered write handle from [`IoService::open_channel`].
///
/// Content accumulates in memory and is written in one store operation by
/// [`close`](FileChannel::close). Dropping an unclosed channel discards the
/// buffer with a warning.
pub struct FileChannel<'a> {
    io: &'a IoService,
    path: StorePath,
    options: WriteOptions,
    buffer: Vec<u8>,
    closed: bool,
}

impl FileChannel<'_> {
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.io.write(&self.path, &self.buffer, &self.options)
    }
}

impl std::io::Write for FileChannel<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for FileChannel<'_> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(path = %self.path.uri(), "file channel dropped without close; content discarded");
        }
    }
}
