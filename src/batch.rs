//! Batch reindexing walker.
//!
//! Walks a subtree through the IO service and feeds every sidecar-bearing
//! path (files and directories alike) to the index engine, committing once
//! at the end. Per-node failures are logged and skipped so one bad entry
//! cannot abort a whole-store rebuild.

use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::document::Document;
use crate::engine::MetaIndexEngine;
use crate::error::{Error, Result};
use crate::io::IoService;
use crate::sidecar;
use crate::store::{FileStore, StorePath};

pub struct BatchIndexer {
    io: Arc<IoService>,
    engine: Arc<dyn MetaIndexEngine>,
    excludes: GlobSet,
}

impl BatchIndexer {
    /// `exclude_globs` match against the store-relative path (forward
    /// slashes, no leading slash).
    pub fn new(
        io: Arc<IoService>,
        engine: Arc<dyn MetaIndexEngine>,
        exclude_globs: &[String],
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_globs {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::InvalidArgument(format!("bad exclude glob {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| Error::InvalidArgument(format!("bad exclude set: {e}")))?;
        Ok(Self {
            io,
            engine,
            excludes,
        })
    }

    /// Index every sidecar-bearing path under `root` (inclusive), then
    /// commit. Returns the number of paths indexed.
    pub fn run(&self, root: &StorePath) -> Result<usize> {
        let mut indexed = 0;
        self.visit(root, &mut indexed);
        self.engine.commit()?;
        tracing::info!(root = %root.uri(), indexed, "batch index complete");
        Ok(indexed)
    }

    fn excluded(&self, path: &StorePath) -> bool {
        self.excludes.is_match(path.rel())
    }

    fn visit(&self, path: &StorePath, indexed: &mut usize) {
        if sidecar::is_sidecar(path) || self.excluded(path) {
            return;
        }
        match self.index_one(path) {
            Ok(true) => *indexed += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %path.uri(), error = %err, "batch index skipped path");
            }
        }
        let is_dir = match self.io.metadata(path) {
            Ok(meta) => meta.is_dir(),
            Err(err) => {
                tracing::warn!(path = %path.uri(), error = %err, "batch index cannot stat path");
                return;
            }
        };
        if is_dir {
            let children = match self.io.store(path.store()) {
                Some(store) => store.read_dir(path),
                None => return,
            };
            match children {
                Ok(children) => {
                    for child in children {
                        self.visit(&child, indexed);
                    }
                }
                Err(err) => {
                    tracing::warn!(path = %path.uri(), error = %err, "batch index cannot list directory");
                }
            }
        }
    }

    /// Index `path` if it carries a sidecar record. Reports whether it did.
    fn index_one(&self, path: &StorePath) -> Result<bool> {
        let store = self
            .io
            .store(path.store())
            .ok_or_else(|| Error::NotFound(format!("store {} is not mounted", path.store())))?;
        if !sidecar::exists(store.as_ref(), path) {
            return Ok(false);
        }
        let attrs = self.io.read_all_attributes(path)?;
        self.engine.index(&Document::from_attrs(&path.uri(), &attrs))?;
        Ok(true)
    }
}
