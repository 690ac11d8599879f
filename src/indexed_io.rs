//! Indexing-synchronized IO.
//!
//! [`IndexedIoService`] wraps the attribute-aware [`IoService`] and keeps
//! the index engine synchronized with it: every successful mutation is
//! followed by the matching index operation. Indexing failures never fail
//! the IO operation that triggered them; they are logged and the store
//! remains the source of truth.
//!
//! Each opened store also gets a dedicated watcher thread translating
//! external change events into the same index operations, so out-of-band
//! mutations converge too. Self-originated events arriving through the
//! watcher are harmless: re-indexing is an idempotent upsert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::attrs::{AttrMap, PropertyValue};
use crate::batch::BatchIndexer;
use crate::config::WatcherConfig;
use crate::document::{DocKey, Document};
use crate::engine::MetaIndexEngine;
use crate::error::Result;
use crate::io::{FileChannel, IoService, WriteOptions};
use crate::sidecar;
use crate::store::{ChangeEvent, ChangeKind, FileStore, StorePath};

struct StoreWatcher {
    store: String,
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct IndexedIoService {
    io: Arc<IoService>,
    engine: Arc<dyn MetaIndexEngine>,
    watcher_config: WatcherConfig,
    watchers: Mutex<Vec<StoreWatcher>>,
}

impl IndexedIoService {
    pub fn new(
        io: Arc<IoService>,
        engine: Arc<dyn MetaIndexEngine>,
        watcher_config: WatcherConfig,
    ) -> Self {
        Self {
            io,
            engine,
            watcher_config,
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn io(&self) -> &IoService {
        &self.io
    }

    pub fn engine(&self) -> &Arc<dyn MetaIndexEngine> {
        &self.engine
    }

    // ---- store lifecycle ---------------------------------------------------

    /// Mount a store, batch-index it if the index holds nothing yet, and
    /// start its watcher thread.
    pub fn open_store(&self, store: Arc<dyn FileStore>) -> Result<()> {
        self.io.mount(store.clone())?;
        if self.engine.fresh_index()? {
            self.batch_index(store.name())?;
        }
        self.start_watcher(store)
    }

    /// Mount a brand-new store: batch-index it unconditionally and start
    /// its watcher thread.
    pub fn create_store(&self, store: Arc<dyn FileStore>) -> Result<()> {
        self.io.mount(store.clone())?;
        self.batch_index(store.name())?;
        self.start_watcher(store)
    }

    /// Rebuild the index entries for one mounted store, unconditionally.
    pub fn batch_index(&self, store_name: &str) -> Result<usize> {
        let store = self.io.store(store_name).ok_or_else(|| {
            crate::error::Error::NotFound(format!("store {store_name} is not mounted"))
        })?;
        let batch = BatchIndexer::new(
            self.io.clone(),
            self.engine.clone(),
            &self.watcher_config.exclude_globs,
        )?;
        batch.run(&store.resolve(""))
    }

    /// Stop the store's watcher, close the store, and unmount it.
    pub fn close_store(&self, store_name: &str) -> Result<()> {
        let watcher = {
            let mut watchers = self.watchers.lock();
            watchers
                .iter()
                .position(|w| w.store == store_name)
                .map(|i| watchers.swap_remove(i))
        };
        if let Some(store) = self.io.unmount(store_name) {
            store.close();
        }
        if let Some(watcher) = watcher {
            watcher.cancel.store(true, Ordering::SeqCst);
            if watcher.thread.join().is_err() {
                tracing::warn!(store = store_name, "watcher thread panicked");
            }
        }
        self.engine.commit()
    }

    fn start_watcher(&self, store: Arc<dyn FileStore>) -> Result<()> {
        let rx = store.watch()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let io = self.io.clone();
        let engine = self.engine.clone();
        let poll = self.watcher_config.poll_interval();
        let name = store.name().to_string();

        let thread = std::thread::Builder::new()
            .name(format!("sidecarfs-watch-{name}"))
            .spawn({
                let cancel = cancel.clone();
                let name = name.clone();
                move || {
                    tracing::debug!(store = %name, "watcher started");
                    loop {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        match rx.recv_timeout(poll) {
                            Ok(batch) => apply_events(io.as_ref(), engine.as_ref(), &batch),
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    tracing::debug!(store = %name, "watcher stopped");
                }
            })
            .map_err(crate::error::Error::Backend)?;

        self.watchers.lock().push(StoreWatcher {
            store: name,
            cancel,
            thread,
        });
        Ok(())
    }

    // ---- synchronized operations -------------------------------------------

    fn reindex(&self, path: &StorePath) {
        reindex_path(self.io.as_ref(), self.engine.as_ref(), path);
        if let Err(err) = self.engine.commit() {
            tracing::warn!(path = %path.uri(), error = %err, "index commit failed");
        }
    }

    pub fn create_file(&self, path: &StorePath, options: &WriteOptions) -> Result<()> {
        self.io.create_file(path, options)?;
        self.reindex(path);
        Ok(())
    }

    pub fn create_directory(&self, path: &StorePath) -> Result<()> {
        self.io.create_directory(path)?;
        self.reindex(path);
        Ok(())
    }

    pub fn create_directories(&self, path: &StorePath) -> Result<()> {
        self.io.create_directories(path)?;
        self.reindex(path);
        Ok(())
    }

    pub fn write(&self, path: &StorePath, bytes: &[u8], options: &WriteOptions) -> Result<()> {
        self.io.write(path, bytes, options)?;
        self.reindex(path);
        Ok(())
    }

    /// Buffered write handle whose `close` both persists the content and
    /// runs the same reindex sequence as [`write`](Self::write).
    pub fn open_channel(
        &self,
        path: &StorePath,
        options: WriteOptions,
    ) -> Result<IndexedFileChannel<'_>> {
        Ok(IndexedFileChannel {
            service: self,
            path: path.clone(),
            inner: self.io.open_channel(path, options)?,
        })
    }

    pub fn set_attribute(&self, path: &StorePath, name: &str, value: PropertyValue) -> Result<()> {
        self.io.set_attribute(path, name, value)?;
        self.reindex(path);
        Ok(())
    }

    pub fn set_attributes(&self, path: &StorePath, attrs: &AttrMap) -> Result<()> {
        self.io.set_attributes(path, attrs)?;
        self.reindex(path);
        Ok(())
    }

    pub fn copy(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        self.io.copy(from, to)?;
        self.reindex(to);
        Ok(())
    }

    /// Move a path. The index entry is relabeled in place; the target is
    /// never re-read to rebuild it.
    pub fn rename(&self, from: &StorePath, to: &StorePath) -> Result<()> {
        self.io.rename(from, to)?;
        if let Err(err) = self
            .engine
            .rename(&DocKey::for_path(&from.uri()), &DocKey::for_path(&to.uri()))
        {
            tracing::warn!(from = %from.uri(), to = %to.uri(), error = %err, "index rename failed");
        }
        Ok(())
    }

    pub fn delete(&self, path: &StorePath) -> Result<()> {
        self.io.delete(path)?;
        if let Err(err) = self.engine.delete(&DocKey::for_path(&path.uri())) {
            tracing::warn!(path = %path.uri(), error = %err, "index delete failed");
        }
        Ok(())
    }

    pub fn delete_if_exists(&self, path: &StorePath) -> Result<bool> {
        let removed = self.io.delete_if_exists(path)?;
        if removed {
            if let Err(err) = self.engine.delete(&DocKey::for_path(&path.uri())) {
                tracing::warn!(path = %path.uri(), error = %err, "index delete failed");
            }
        }
        Ok(removed)
    }

    // read-side pass-throughs

    pub fn exists(&self, path: &StorePath) -> bool {
        self.io.exists(path)
    }

    pub fn read(&self, path: &StorePath) -> Result<Vec<u8>> {
        self.io.read(path)
    }

    pub fn read_to_string(&self, path: &StorePath) -> Result<String> {
        self.io.read_to_string(path)
    }

    pub fn read_attributes(&self, path: &StorePath, selector: &str) -> Result<AttrMap> {
        self.io.read_attributes(path, selector)
    }
}

/// Buffered write handle from [`IndexedIoService::open_channel`]. Content
/// reaches the store and the index only on `close`.
pub struct IndexedFileChannel<'a> {
    service: &'a IndexedIoService,
    path: StorePath,
    inner: FileChannel<'a>,
}

impl IndexedFileChannel<'_> {
    pub fn close(self) -> Result<()> {
        self.inner.close()?;
        self.service.reindex(&self.path);
        Ok(())
    }
}

impl std::io::Write for IndexedFileChannel<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::Write::write(&mut self.inner, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut self.inner)
    }
}

impl Drop for IndexedIoService {
    fn drop(&mut self) {
        for watcher in self.watchers.lock().drain(..) {
            watcher.cancel.store(true, Ordering::SeqCst);
            let _ = watcher.thread.join();
        }
    }
}

/// Map a sidecar path back to the primary path it annotates.
fn primary_of(side: &StorePath) -> Option<StorePath> {
    let name = side.file_name()?;
    let primary = name.strip_prefix('.')?;
    if primary.is_empty() {
        return None;
    }
    Some(side.sibling(primary))
}

fn reindex_path(io: &IoService, engine: &dyn MetaIndexEngine, path: &StorePath) {
    let attrs = match io.read_all_attributes(path) {
        Ok(attrs) => attrs,
        Err(err) => {
            tracing::warn!(path = %path.uri(), error = %err, "cannot read attributes for indexing");
            return;
        }
    };
    let doc = Document::from_attrs(&path.uri(), &attrs);
    if let Err(err) = engine.index(&doc) {
        tracing::warn!(path = %path.uri(), error = %err, "indexing failed");
    }
}

/// Re-read and reindex the primary path a sidecar record annotates, if that
/// primary still exists.
fn fold_sidecar(io: &IoService, engine: &dyn MetaIndexEngine, side: &StorePath) {
    if let Some(primary) = primary_of(side) {
        if io.exists(&primary) {
            io.invalidate(&primary);
            reindex_path(io, engine, &primary);
        }
    }
}

/// Translate one batch of external change events into index operations.
/// Sidecar events fold back onto their primary path — a sidecar mutation
/// (including its deletion) changes the primary's attribute set, never its
/// index membership. Commits once per batch.
pub(crate) fn apply_events(io: &IoService, engine: &dyn MetaIndexEngine, events: &[ChangeEvent]) {
    for event in events {
        let path = &event.path;
        match event.kind {
            ChangeKind::Renamed => {
                let Some(new_path) = &event.new_path else {
                    continue;
                };
                match (sidecar::is_sidecar(path), sidecar::is_sidecar(new_path)) {
                    (false, false) => {
                        if let Err(err) = engine.rename(
                            &DocKey::for_path(&path.uri()),
                            &DocKey::for_path(&new_path.uri()),
                        ) {
                            tracing::warn!(from = %path.uri(), to = %new_path.uri(), error = %err, "index rename failed");
                        }
                    }
                    // The path left the indexable set; its entry would
                    // otherwise go permanently stale.
                    (false, true) => {
                        if let Err(err) = engine.delete(&DocKey::for_path(&path.uri())) {
                            tracing::warn!(path = %path.uri(), error = %err, "index delete failed");
                        }
                        fold_sidecar(io, engine, new_path);
                    }
                    // A hidden path became visible: index it fresh.
                    (true, false) => {
                        fold_sidecar(io, engine, path);
                        if io.exists(new_path) {
                            io.invalidate(new_path);
                            reindex_path(io, engine, new_path);
                        }
                    }
                    // Sidecar relabeled: both primaries' attribute sets change.
                    (true, true) => {
                        fold_sidecar(io, engine, path);
                        fold_sidecar(io, engine, new_path);
                    }
                }
            }
            _ if sidecar::is_sidecar(path) => fold_sidecar(io, engine, path),
            ChangeKind::Created | ChangeKind::Modified => {
                if io.exists(path) {
                    io.invalidate(path);
                    reindex_path(io, engine, path);
                }
            }
            ChangeKind::Deleted => {
                if let Err(err) = engine.delete(&DocKey::for_path(&path.uri())) {
                    tracing::warn!(path = %path.uri(), error = %err, "index delete failed");
                }
            }
        }
    }
    if let Err(err) = engine.commit() {
        tracing::warn!(error = %err, "index commit failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::engine::TantivyEngine;
    use crate::metamodel::InMemoryMetaModelStore;
    use crate::store::DiskStore;

    fn fixture() -> (
        tempfile::TempDir,
        IndexedIoService,
        Arc<TantivyEngine>,
        Arc<DiskStore>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open("repo", dir.path()).unwrap());
        let io = Arc::new(IoService::new());
        io.mount(store.clone()).unwrap();
        let engine = Arc::new(
            TantivyEngine::open(
                &IndexConfig::default(),
                Arc::new(InMemoryMetaModelStore::new()),
            )
            .unwrap(),
        );
        let service = IndexedIoService::new(io, engine.clone(), WatcherConfig::default());
        (dir, service, engine, store)
    }

    fn count(engine: &TantivyEngine, query: &str) -> usize {
        let lease = engine.acquire_reader().unwrap();
        let n = engine.count(&lease, query).unwrap();
        engine.release_reader(lease).unwrap();
        n
    }

    #[test]
    fn write_then_search() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("doc.txt");
        service
            .write(&path, b"body", &WriteOptions::default())
            .unwrap();
        service
            .set_attribute(&path, "dcore.author", PropertyValue::Text("Ann".into()))
            .unwrap();

        assert_eq!(count(&engine, "props.dcore.author:ann"), 1);
    }

    #[test]
    fn delete_removes_index_entry() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("doc.txt");
        service
            .write(&path, b"body", &WriteOptions::default())
            .unwrap();
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            1
        );

        service.delete(&path).unwrap();
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            0
        );
    }

    #[test]
    fn rename_relabels_without_rereading() {
        let (_dir, service, engine, store) = fixture();
        let from = store.resolve("a.txt");
        let to = store.resolve("b.txt");
        service
            .write(&from, b"body", &WriteOptions::default())
            .unwrap();
        service
            .set_attribute(&from, "dcore.author", PropertyValue::Text("Ann".into()))
            .unwrap();

        service.rename(&from, &to).unwrap();
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&to.uri()).id())),
            1
        );
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&from.uri()).id())),
            0
        );
        assert_eq!(count(&engine, "props.dcore.author:ann"), 1);
    }

    #[test]
    fn channel_close_reaches_the_index() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("via-channel.txt");
        let mut channel = service
            .open_channel(&path, WriteOptions::commented("ann", "streamed"))
            .unwrap();
        std::io::Write::write_all(&mut channel, b"streamed body").unwrap();
        channel.close().unwrap();

        assert_eq!(service.read_to_string(&path).unwrap(), "streamed body");
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            1
        );
        assert_eq!(count(&engine, "props.version.comment:streamed"), 1);
    }

    #[test]
    fn rename_into_the_hidden_set_drops_the_entry() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("a.txt");
        service
            .write(&path, b"body", &WriteOptions::default())
            .unwrap();
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            1
        );

        // Out-of-band move to a hidden name.
        let hidden = store.resolve(".a.txt");
        store.write(&hidden, &store.read(&path).unwrap()).unwrap();
        store.remove(&path).unwrap();
        apply_events(
            service.io(),
            engine.as_ref(),
            &[ChangeEvent {
                kind: ChangeKind::Renamed,
                path: path.clone(),
                new_path: Some(hidden),
            }],
        );

        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            0
        );
    }

    #[test]
    fn rename_out_of_the_hidden_set_indexes_the_new_path() {
        let (_dir, service, engine, store) = fixture();
        let visible = store.resolve("b.txt");
        // Out-of-band: a hidden file became visible.
        store.write(&visible, b"now visible").unwrap();
        apply_events(
            service.io(),
            engine.as_ref(),
            &[ChangeEvent {
                kind: ChangeKind::Renamed,
                path: store.resolve(".b.txt"),
                new_path: Some(visible.clone()),
            }],
        );

        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&visible.uri()).id())),
            1
        );
    }

    #[test]
    fn external_events_converge_the_index() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("ext.txt");
        // Out-of-band write: straight through the store, no indexing.
        store.write(&path, b"external").unwrap();
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            0
        );

        apply_events(
            service.io(),
            engine.as_ref(),
            &[ChangeEvent {
                kind: ChangeKind::Created,
                path: path.clone(),
                new_path: None,
            }],
        );
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            1
        );

        apply_events(
            service.io(),
            engine.as_ref(),
            &[ChangeEvent {
                kind: ChangeKind::Deleted,
                path: path.clone(),
                new_path: None,
            }],
        );
        assert_eq!(
            count(&engine, &format!("id:{}", DocKey::for_path(&path.uri()).id())),
            0
        );
    }

    #[test]
    fn sidecar_events_fold_onto_the_primary() {
        let (_dir, service, engine, store) = fixture();
        let path = store.resolve("doc.txt");
        store.write(&path, b"body").unwrap();
        // Out-of-band sidecar edit.
        store
            .write(&store.resolve(".doc.txt"), b"dcore.author=Ann\n")
            .unwrap();

        apply_events(
            service.io(),
            engine.as_ref(),
            &[ChangeEvent {
                kind: ChangeKind::Modified,
                path: store.resolve(".doc.txt"),
                new_path: None,
            }],
        );
        assert_eq!(count(&engine, "props.dcore.author:ann"), 1);
    }

    #[test]
    fn open_store_batch_indexes_a_fresh_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open("repo", dir.path()).unwrap());
        store.write(&store.resolve("f.txt"), b"x").unwrap();
        store
            .write(&store.resolve(".f.txt"), b"dcore.author=Ann\n")
            .unwrap();

        let io = Arc::new(IoService::new());
        let engine = Arc::new(
            TantivyEngine::open(
                &IndexConfig::default(),
                Arc::new(InMemoryMetaModelStore::new()),
            )
            .unwrap(),
        );
        let service = IndexedIoService::new(io, engine.clone(), WatcherConfig::default());
        service.open_store(store).unwrap();

        assert_eq!(count(&engine, "props.dcore.author:ann"), 1);
        service.close_store("repo").unwrap();
    }
}
