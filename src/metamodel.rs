//! Metamodel: the dynamic schema registry inferred from indexed documents.
//!
//! Each [`MetaObject`] is keyed by document type name and holds the union of
//! property names (with inferred value kind) ever observed for that type.
//! Entries grow additively — a property, once observed, is never removed —
//! and are never deleted by normal operation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::attrs::{split_indexed, ValueKind};
use crate::document::Document;
use crate::error::{Error, Result};

/// One observed property of a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaProperty {
    pub name: String,
    pub kind: ValueKind,
    pub searchable: bool,
}

/// Schema entry for one document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaObject {
    pub type_name: String,
    properties: BTreeMap<String, MetaProperty>,
}

impl MetaObject {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// Build the schema entry a single document implies. Repeat indices are
    /// collapsed: `title[2]` contributes the property `title`.
    pub fn from_document(doc: &Document) -> Self {
        let mut meta = Self::new(&doc.type_name);
        meta.merge_document(doc);
        meta
    }

    /// Additive merge from a document: unseen properties are added, existing
    /// ones are untouched. Returns whether anything changed.
    pub fn merge_document(&mut self, doc: &Document) -> bool {
        let mut changed = false;
        for prop in &doc.properties {
            let (base, _) = split_indexed(&prop.name);
            if !self.properties.contains_key(base) {
                self.properties.insert(
                    base.to_string(),
                    MetaProperty {
                        name: base.to_string(),
                        kind: prop.value.kind(),
                        searchable: prop.searchable,
                    },
                );
                changed = true;
            }
        }
        changed
    }

    /// Additive merge from another schema entry of the same type.
    pub fn merge(&mut self, other: &MetaObject) {
        for (name, prop) in &other.properties {
            self.properties.entry(name.clone()).or_insert(prop.clone());
        }
    }

    pub fn property(&self, name: &str) -> Option<&MetaProperty> {
        self.properties.get(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Schema registry storage.
///
/// `add` and `update` are both upserts keyed by type name: `add` against an
/// existing entry merges rather than overwriting with fewer properties.
/// Durability is an implementation choice; a durable store must survive
/// restart with all previously merged properties intact.
pub trait MetaModelStore: Send + Sync {
    fn add(&self, meta: MetaObject) -> Result<()>;

    fn update(&self, meta: MetaObject) -> Result<()>;

    fn get(&self, type_name: &str) -> Option<MetaObject>;
}

/// Purely in-memory registry.
#[derive(Default)]
pub struct InMemoryMetaModelStore {
    entries: RwLock<HashMap<String, MetaObject>>,
}

impl InMemoryMetaModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert(entries: &mut HashMap<String, MetaObject>, meta: MetaObject) {
    entries
        .entry(meta.type_name.clone())
        .and_modify(|existing| existing.merge(&meta))
        .or_insert(meta);
}

impl MetaModelStore for InMemoryMetaModelStore {
    fn add(&self, meta: MetaObject) -> Result<()> {
        upsert(&mut self.entries.write(), meta);
        Ok(())
    }

    fn update(&self, meta: MetaObject) -> Result<()> {
        upsert(&mut self.entries.write(), meta);
        Ok(())
    }

    fn get(&self, type_name: &str) -> Option<MetaObject> {
        self.entries.read().get(type_name).cloned()
    }
}

/// Durable registry persisted as one JSON map keyed by type name, rewritten
/// after each mutation.
pub struct JsonMetaModelStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, MetaObject>>,
}

impl JsonMetaModelStore {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let entries = if path.exists() {
            let bytes = std::fs::read(path)
                .map_err(|e| Error::from_io(e, &path.display().to_string()))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidArgument(format!("bad metamodel file: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, MetaObject>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::from_io(e, &parent.display().to_string()))?;
        }
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::InvalidArgument(format!("metamodel encode: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))
    }
}

impl MetaModelStore for JsonMetaModelStore {
    fn add(&self, meta: MetaObject) -> Result<()> {
        let mut entries = self.entries.write();
        upsert(&mut entries, meta);
        self.flush(&entries)
    }

    fn update(&self, meta: MetaObject) -> Result<()> {
        let mut entries = self.entries.write();
        upsert(&mut entries, meta);
        self.flush(&entries)
    }

    fn get(&self, type_name: &str) -> Option<MetaObject> {
        self.entries.read().get(type_name).cloned()
    }
}
