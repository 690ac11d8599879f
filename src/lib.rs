//! # sidecarfs
//!
//! A hierarchical file-store layer with sidecar extended attributes and a
//! continuously synchronized search index.
//!
//! Every path in a mounted store may carry typed, namespaced extended
//! attributes persisted in a hidden sibling record (`.{filename}`). The
//! indexing layer shadows every successful mutation with the matching index
//! operation, and a per-store watcher thread folds out-of-band changes back
//! in, so the index converges on the store without ever being authoritative.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────┐
//! │ IndexedIoService │────▶│ MetaIndexEngine│──▶ tantivy index
//! │  (sync + watch)  │     │  + metamodel  │
//! └────────┬─────────┘     └───────────────┘
//!          ▼
//! ┌──────────────────┐     ┌───────────────┐
//! │    IoService     │────▶│ sidecar record │
//! │ (attrs + bytes)  │     │  `.{name}`    │
//! └────────┬─────────┘     └───────────────┘
//!          ▼
//! ┌──────────────────┐
//! │    FileStore     │  (DiskStore, or any backend behind the trait)
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Error taxonomy |
//! | [`config`] | TOML configuration parsing |
//! | [`store`] | Store abstraction, paths, change events |
//! | [`sidecar`] | Sidecar record format and persistence |
//! | [`attrs`] | Attribute views and the per-path registry |
//! | [`io`] | Attribute-aware IO over mounted stores |
//! | [`document`] | Index projection of a path |
//! | [`metamodel`] | Dynamic schema registry |
//! | [`engine`] | Index engine and reader leases |
//! | [`indexed_io`] | Indexing-synchronized IO and watchers |
//! | [`batch`] | Batch reindexing walker |

pub mod attrs;
pub mod batch;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod indexed_io;
pub mod io;
pub mod metamodel;
pub mod sidecar;
pub mod store;

pub use attrs::{AttrMap, AttributeView, PropertyValue, ViewKind};
pub use batch::BatchIndexer;
pub use config::{Config, IndexConfig, WatcherConfig};
pub use document::{doc_id, DocKey, Document, PATH_TYPE};
pub use engine::{MetaIndexEngine, ReaderLease, SearchHit, TantivyEngine};
pub use error::{Error, Result};
pub use indexed_io::{IndexedFileChannel, IndexedIoService};
pub use io::{FileChannel, IoService, WriteOptions};
pub use metamodel::{InMemoryMetaModelStore, JsonMetaModelStore, MetaModelStore, MetaObject};
pub use store::{ChangeEvent, ChangeKind, DiskStore, EntryKind, EntryMeta, FileStore, StorePath};
