//! The index engine.
//!
//! [`MetaIndexEngine`] is the conceptual wire contract with the search
//! backend: `index`, `delete`, `rename`, `commit`, `fresh_index`, and the
//! reader lease pair. [`TantivyEngine`] implements it over a tantivy index
//! with a fixed outer schema (`id`/`type`/`key` raw fields plus one
//! searchable and one stored-only JSON field), so the metamodel can evolve
//! without index rebuilds.
//!
//! Delete and rename resolve the logical key to a physical entry with a
//! two-level lookup: walk the index segments in order, seek the key's term
//! in each segment's inverted index, take the first live posting, and
//! translate it to a global ordinal by adding the document counts of all
//! preceding segments. The walk short-circuits on the first hit — document
//! identifiers are unique across the index by construction.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Document as _, Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{
    DocAddress, DocSet, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument,
    Term, TERMINATED,
};
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::document::{DocKey, Document};
use crate::error::{Error, Result};
use crate::metamodel::{MetaModelStore, MetaObject};

/// Point-in-time index snapshot.
///
/// Every lease from [`MetaIndexEngine::acquire_reader`] must be returned
/// through exactly one [`MetaIndexEngine::release_reader`] call, including on
/// error paths.
pub struct ReaderLease {
    id: Uuid,
    searcher: Searcher,
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub key: String,
    pub score: f32,
}

/// Index backend contract.
///
/// Any backend providing these operations with the stated consistency
/// guarantees is substitutable: upsert by identifier, idempotent delete,
/// rename as relabel-and-reinsert, near-real-time snapshot readers.
pub trait MetaIndexEngine: Send + Sync {
    /// Upsert: remove any entry sharing the document's identifier, insert
    /// the new entry, then merge the document's schema into the metamodel.
    fn index(&self, doc: &Document) -> Result<()>;

    /// Remove the entry whose identifier matches `key`. A miss is not an
    /// error.
    fn delete(&self, key: &DocKey) -> Result<()>;

    /// Relabel the entry for `from` to carry `to`'s identifier and key:
    /// lookup + field patch + re-add, never an in-place key mutation.
    /// A missing source is not an error.
    fn rename(&self, from: &DocKey, to: &DocKey) -> Result<()>;

    /// Whether the index currently holds zero documents.
    fn fresh_index(&self) -> Result<bool>;

    /// Make buffered writes durable and visible to subsequently acquired
    /// readers. A reader acquired before a write may legitimately not
    /// observe it.
    fn commit(&self) -> Result<()>;

    fn acquire_reader(&self) -> Result<ReaderLease>;

    fn release_reader(&self, lease: ReaderLease) -> Result<()>;

    /// Documents visible to `lease`.
    fn doc_count(&self, lease: &ReaderLease) -> u64;

    /// Hits for a query string (e.g. `props.dcore.author:Ann`,
    /// `key:"repo:/a/b.txt"`). A zero `limit` yields no hits.
    fn search(&self, lease: &ReaderLease, query: &str, limit: usize) -> Result<Vec<SearchHit>>;

    /// Hit count for a query string.
    fn count(&self, lease: &ReaderLease, query: &str) -> Result<usize>;
}

struct Fields {
    id: Field,
    key: Field,
    props: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("type", STRING | STORED);
    let key = builder.add_text_field("key", STRING | STORED);
    let props = builder.add_json_field("props", TEXT | STORED);
    builder.add_json_field("extra", STORED);
    let schema = builder.build();
    (schema, Fields { id, key, props })
}

/// Result of the primary-key lookup: where the live entry physically sits.
#[derive(Debug, Clone, Copy)]
struct PkHit {
    /// Process-global document ordinal: segment-local id plus the cumulative
    /// document counts of all preceding segments.
    ordinal: u64,
    address: DocAddress,
}

/// Tantivy-backed engine.
pub struct TantivyEngine {
    index: Index,
    schema: Schema,
    fields: Fields,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    meta_store: Arc<dyn MetaModelStore>,
    leases: Mutex<HashSet<Uuid>>,
}

impl TantivyEngine {
    /// Open (or create) the engine per `config`. `index.path = None` keeps
    /// the index in RAM.
    pub fn open(config: &IndexConfig, meta_store: Arc<dyn MetaModelStore>) -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = match &config.path {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| Error::from_io(e, &dir.display().to_string()))?;
                let directory = MmapDirectory::open(dir)
                    .map_err(|e| Error::Unsupported(format!("cannot open index dir: {e}")))?;
                Index::open_or_create(directory, schema.clone())?
            }
            None => Index::create_in_ram(schema.clone()),
        };
        let writer = index.writer(config.writer_heap_mb.max(15) * 1_000_000)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            schema,
            fields,
            writer: Mutex::new(writer),
            reader,
            meta_store,
            leases: Mutex::new(HashSet::new()),
        })
    }

    fn to_tantivy_doc(&self, id: &str, doc: &Document) -> Result<TantivyDocument> {
        let json = serde_json::json!({
            "id": id,
            "type": doc.type_name,
            "key": doc.key,
            "props": serde_json::Value::Object(doc.searchable_json()),
            "extra": serde_json::Value::Object(doc.stored_json()),
        });
        TantivyDocument::parse_json(&self.schema, &json.to_string())
            .map_err(|e| Error::InvalidArgument(format!("unindexable document: {e}")))
    }

    fn merge_metamodel(&self, doc: &Document) -> Result<()> {
        let incoming = MetaObject::from_document(doc);
        match self.meta_store.get(&doc.type_name) {
            None => self.meta_store.add(incoming),
            Some(_) => self.meta_store.update(incoming),
        }
    }

    fn commit_and_reload(&self) -> Result<()> {
        self.writer.lock().commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Two-level primary-key resolution across index segments. Returns one
    /// slot per requested identifier; `None` is the not-found sentinel.
    fn lookup_pk(&self, searcher: &Searcher, ids: &[&str]) -> Result<Vec<Option<PkHit>>> {
        let mut results: Vec<Option<PkHit>> = vec![None; ids.len()];
        for (slot, id) in ids.iter().enumerate() {
            let term = Term::from_field_text(self.fields.id, id);
            let mut base: u64 = 0;
            for (seg_ord, segment) in searcher.segment_readers().iter().enumerate() {
                let inverted = segment.inverted_index(self.fields.id)?;
                if let Some(mut postings) =
                    inverted.read_postings(&term, IndexRecordOption::Basic)?
                {
                    let mut doc = postings.doc();
                    while doc != TERMINATED && segment.is_deleted(doc) {
                        doc = postings.advance();
                    }
                    if doc != TERMINATED {
                        results[slot] = Some(PkHit {
                            ordinal: base + doc as u64,
                            address: DocAddress::new(seg_ord as u32, doc),
                        });
                        // Identifiers are unique; first live match wins.
                        break;
                    }
                }
                base += segment.max_doc() as u64;
            }
        }
        Ok(results)
    }

    fn parse_query(&self, query: &str) -> Result<Box<dyn tantivy::query::Query>> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.props]);
        parser
            .parse_query(query)
            .map_err(|e| Error::InvalidArgument(format!("bad query {query:?}: {e}")))
    }
}

impl MetaIndexEngine for TantivyEngine {
    fn index(&self, doc: &Document) -> Result<()> {
        let id = doc.id();
        let tdoc = self.to_tantivy_doc(&id, doc)?;
        {
            let writer = self.writer.lock();
            writer.delete_term(Term::from_field_text(self.fields.id, &id));
            writer.add_document(tdoc)?;
        }
        tracing::debug!(key = %doc.key, id = %id, "indexed document");
        self.merge_metamodel(doc)
    }

    fn delete(&self, key: &DocKey) -> Result<()> {
        // The segment walk operates on committed state.
        self.commit_and_reload()?;
        let searcher = self.reader.searcher();
        let id = key.id();
        let hits = self.lookup_pk(&searcher, &[&id])?;
        if let Some(hit) = hits[0] {
            tracing::debug!(key = %key.key, ordinal = hit.ordinal, "deleting document");
            self.writer
                .lock()
                .delete_term(Term::from_field_text(self.fields.id, &id));
            self.commit_and_reload()?;
        }
        Ok(())
    }

    fn rename(&self, from: &DocKey, to: &DocKey) -> Result<()> {
        self.commit_and_reload()?;
        let searcher = self.reader.searcher();
        let from_id = from.id();
        let hits = self.lookup_pk(&searcher, &[&from_id])?;
        let Some(hit) = hits[0] else {
            return Ok(());
        };

        // Lookup + identity-field patch + re-add. The backend has no
        // in-place key mutation.
        let stored: TantivyDocument = searcher.doc(hit.address)?;
        let mut named = serde_json::to_value(stored.to_named_doc(&self.schema))
            .map_err(|e| Error::InvalidArgument(format!("unreadable stored document: {e}")))?;
        let obj = named
            .as_object_mut()
            .ok_or_else(|| Error::InvalidArgument("stored document is not an object".into()))?;
        obj.insert("id".into(), serde_json::json!([to.id()]));
        obj.insert("key".into(), serde_json::json!([to.key]));
        let patched = TantivyDocument::parse_json(&self.schema, &named.to_string())
            .map_err(|e| Error::InvalidArgument(format!("unindexable document: {e}")))?;

        {
            let writer = self.writer.lock();
            writer.delete_term(Term::from_field_text(self.fields.id, &from_id));
            writer.add_document(patched)?;
        }
        tracing::debug!(from = %from.key, to = %to.key, "renamed document");
        self.commit_and_reload()
    }

    fn fresh_index(&self) -> Result<bool> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs() == 0)
    }

    fn commit(&self) -> Result<()> {
        self.commit_and_reload()
    }

    fn acquire_reader(&self) -> Result<ReaderLease> {
        let lease = ReaderLease {
            id: Uuid::new_v4(),
            searcher: self.reader.searcher(),
        };
        self.leases.lock().insert(lease.id);
        Ok(lease)
    }

    fn release_reader(&self, lease: ReaderLease) -> Result<()> {
        if !self.leases.lock().remove(&lease.id) {
            return Err(Error::InvalidArgument(
                "reader lease already released".into(),
            ));
        }
        Ok(())
    }

    fn doc_count(&self, lease: &ReaderLease) -> u64 {
        lease.searcher.num_docs()
    }

    fn search(&self, lease: &ReaderLease, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let parsed = self.parse_query(query)?;
        let top = lease
            .searcher
            .search(&parsed, &TopDocs::with_limit(limit))?;
        let mut out = Vec::with_capacity(top.len());
        for (score, address) in top {
            let stored: TantivyDocument = lease.searcher.doc(address)?;
            let field_text = |field: Field| -> String {
                stored
                    .get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            out.push(SearchHit {
                id: field_text(self.fields.id),
                key: field_text(self.fields.key),
                score,
            });
        }
        Ok(out)
    }

    fn count(&self, lease: &ReaderLease, query: &str) -> Result<usize> {
        let parsed = self.parse_query(query)?;
        Ok(lease.searcher.search(&parsed, &Count)?)
    }
}

impl Drop for TantivyEngine {
    fn drop(&mut self) {
        let outstanding = self.leases.lock().len();
        if outstanding > 0 {
            tracing::warn!(outstanding, "engine dropped with unreleased reader leases");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::PropertyValue;
    use crate::document::DocProperty;
    use crate::metamodel::InMemoryMetaModelStore;

    fn engine() -> (TantivyEngine, Arc<InMemoryMetaModelStore>) {
        let meta = Arc::new(InMemoryMetaModelStore::new());
        let engine = TantivyEngine::open(&IndexConfig::default(), meta.clone()).unwrap();
        (engine, meta)
    }

    fn doc(key: &str, props: &[(&str, &str)]) -> Document {
        Document {
            type_name: "Path".into(),
            key: key.into(),
            properties: props
                .iter()
                .map(|(n, v)| DocProperty {
                    name: n.to_string(),
                    value: PropertyValue::Text(v.to_string()),
                    searchable: true,
                })
                .collect(),
        }
    }

    fn count(engine: &TantivyEngine, query: &str) -> usize {
        let lease = engine.acquire_reader().unwrap();
        let n = engine.count(&lease, query).unwrap();
        engine.release_reader(lease).unwrap();
        n
    }

    #[test]
    fn index_then_search_and_metamodel() {
        let (engine, meta) = engine();
        engine
            .index(&doc(
                "repo:/a.txt",
                &[
                    ("dcore.author", "Some Author"),
                    ("dcore.comment", "content that matters to users"),
                ],
            ))
            .unwrap();
        engine.commit().unwrap();

        assert_eq!(count(&engine, "props.dcore.author:some"), 1);
        assert_eq!(count(&engine, "props.dcore.comment:users"), 1);
        assert_eq!(count(&engine, "props.dcore.author:nobody"), 0);

        let schema = meta.get("Path").unwrap();
        assert!(schema.property("dcore.author").is_some());
        assert!(schema.property("dcore.comment").is_some());
    }

    #[test]
    fn reindexing_same_key_yields_one_entry() {
        let (engine, _) = engine();
        let d = doc("repo:/a.txt", &[("dcore.author", "Ann")]);
        engine.index(&d).unwrap();
        engine.commit().unwrap();
        engine.index(&d).unwrap();
        engine.commit().unwrap();

        let lease = engine.acquire_reader().unwrap();
        assert_eq!(engine.doc_count(&lease), 1);
        engine.release_reader(lease).unwrap();
    }

    #[test]
    fn rename_relabels_identity_and_preserves_count() {
        let (engine, _) = engine();
        engine
            .index(&doc("repo:/old.txt", &[("dcore.author", "Ann")]))
            .unwrap();
        engine
            .index(&doc("repo:/other.txt", &[("dcore.author", "Bob")]))
            .unwrap();
        engine.commit().unwrap();

        let from = DocKey::for_path("repo:/old.txt");
        let to = DocKey::for_path("repo:/new.txt");
        engine.rename(&from, &to).unwrap();

        let lease = engine.acquire_reader().unwrap();
        assert_eq!(engine.doc_count(&lease), 2);
        engine.release_reader(lease).unwrap();

        assert_eq!(count(&engine, &format!("id:{}", from.id())), 0);
        assert_eq!(count(&engine, &format!("id:{}", to.id())), 1);
        // Properties travel with the relabeled entry.
        assert_eq!(count(&engine, "props.dcore.author:ann"), 1);

        let hits = {
            let lease = engine.acquire_reader().unwrap();
            let hits = engine
                .search(&lease, &format!("id:{}", to.id()), 10)
                .unwrap();
            engine.release_reader(lease).unwrap();
            hits
        };
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "repo:/new.txt");
    }

    #[test]
    fn delete_removes_exactly_one_and_miss_is_ok() {
        let (engine, _) = engine();
        engine
            .index(&doc("repo:/a.txt", &[("dcore.author", "Ann")]))
            .unwrap();
        engine
            .index(&doc("repo:/b.txt", &[("dcore.author", "Bob")]))
            .unwrap();
        engine.commit().unwrap();

        engine.delete(&DocKey::for_path("repo:/a.txt")).unwrap();

        let lease = engine.acquire_reader().unwrap();
        assert_eq!(engine.doc_count(&lease), 1);
        engine.release_reader(lease).unwrap();
        assert_eq!(count(&engine, "props.dcore.author:bob"), 1);

        // Idempotent: a second delete of the same key is a no-op.
        engine.delete(&DocKey::for_path("repo:/a.txt")).unwrap();
        engine.delete(&DocKey::for_path("repo:/never.txt")).unwrap();
    }

    #[test]
    fn zero_limit_search_yields_no_hits() {
        let (engine, _) = engine();
        engine
            .index(&doc("repo:/a.txt", &[("dcore.author", "Ann")]))
            .unwrap();
        engine.commit().unwrap();

        let lease = engine.acquire_reader().unwrap();
        let hits = engine
            .search(&lease, "props.dcore.author:ann", 0)
            .unwrap();
        engine.release_reader(lease).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn rename_of_missing_source_is_a_no_op() {
        let (engine, _) = engine();
        engine
            .rename(
                &DocKey::for_path("repo:/ghost.txt"),
                &DocKey::for_path("repo:/new.txt"),
            )
            .unwrap();
        assert!(engine.fresh_index().unwrap());
    }

    #[test]
    fn fresh_index_flips_after_first_document() {
        let (engine, _) = engine();
        assert!(engine.fresh_index().unwrap());
        engine.index(&doc("repo:/a.txt", &[])).unwrap();
        engine.commit().unwrap();
        assert!(!engine.fresh_index().unwrap());
    }

    #[test]
    fn nrt_reader_does_not_see_later_commits() {
        let (engine, _) = engine();
        engine.index(&doc("repo:/a.txt", &[])).unwrap();
        engine.commit().unwrap();

        let lease = engine.acquire_reader().unwrap();
        engine.index(&doc("repo:/b.txt", &[])).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.doc_count(&lease), 1);
        engine.release_reader(lease).unwrap();

        let lease = engine.acquire_reader().unwrap();
        assert_eq!(engine.doc_count(&lease), 2);
        engine.release_reader(lease).unwrap();
    }

    #[test]
    fn double_release_is_rejected() {
        let (engine, _) = engine();
        let a = engine.acquire_reader().unwrap();
        let b = ReaderLease {
            id: a.id,
            searcher: engine.reader.searcher(),
        };
        engine.release_reader(a).unwrap();
        assert!(engine.release_reader(b).is_err());
    }

    #[test]
    fn lookup_survives_multiple_segments() {
        let (engine, _) = engine();
        // Commit between adds so documents land in separate segments.
        for i in 0..5 {
            engine
                .index(&doc(&format!("repo:/f{i}.txt"), &[("dcore.title", "t")]))
                .unwrap();
            engine.commit().unwrap();
        }

        engine.delete(&DocKey::for_path("repo:/f3.txt")).unwrap();
        let lease = engine.acquire_reader().unwrap();
        assert_eq!(engine.doc_count(&lease), 4);
        engine.release_reader(lease).unwrap();
        assert_eq!(
            count(
                &engine,
                &format!("id:{}", DocKey::for_path("repo:/f3.txt").id())
            ),
            0
        );
    }
}
