//! Attribute views and the per-path view registry.
//!
//! A view is a tagged capability over one path: given the store metadata and
//! the path's sidecar content it materializes an ordered map of property
//! name → typed value. Views are a closed set ([`ViewKind`]) constructed
//! through a tag→constructor registry rather than runtime type lookup.
//!
//! A view instance computes its attribute set once, at construction; after
//! that it always returns the same values (idempotent cache). Repeating
//! properties use the flat `name[i]` addressing of the sidecar format; index
//! zero is written without brackets.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::store::EntryMeta;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

/// Inferred kind of a property value, recorded in the metamodel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValueKind {
    Text,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Text(_) => ValueKind::Text,
            PropertyValue::Integer(_) => ValueKind::Integer,
            PropertyValue::Decimal(_) => ValueKind::Decimal,
            PropertyValue::Boolean(_) => ValueKind::Boolean,
            PropertyValue::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Flat text form used by the sidecar record.
    pub fn render(&self) -> String {
        match self {
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::Integer(i) => i.to_string(),
            PropertyValue::Decimal(d) => d.to_string(),
            PropertyValue::Boolean(b) => b.to_string(),
            PropertyValue::Timestamp(t) => t.to_rfc3339(),
        }
    }
}

/// Ordered property-name → value mapping.
pub type AttrMap = BTreeMap<String, PropertyValue>;

/// Split a flat attribute name into its base and repeat index.
/// `"title[2]"` → `("title", 2)`; `"title"` → `("title", 0)`.
pub fn split_indexed(name: &str) -> (&str, usize) {
    if let (Some(start), Some(end)) = (name.find('['), name.rfind(']')) {
        if start < end {
            if let Ok(idx) = name[start + 1..end].parse::<usize>() {
                return (&name[..start], idx);
            }
        }
    }
    (name, 0)
}

/// Render a base name plus repeat index back into flat form.
pub fn indexed_name(base: &str, idx: usize) -> String {
    if idx == 0 {
        base.to_string()
    } else {
        format!("{base}[{idx}]")
    }
}

/// One attribute view over a path.
pub trait AttributeView: Send + Sync {
    /// Short tag the view is registered under (`"basic"`, `"dcore"`, ...).
    fn name(&self) -> &str;

    /// The full attribute set, computed once at construction.
    fn attributes(&self) -> &AttrMap;

    /// Subset read: each entry in `names` selects matching attributes;
    /// `"*"` selects everything.
    fn read_named(&self, names: &[&str]) -> AttrMap {
        let mut out = AttrMap::new();
        for name in names {
            if *name == "*" {
                out.extend(self.attributes().clone());
                break;
            }
            let want = *name;
            for (key, value) in self.attributes() {
                if split_indexed(key).0 == want {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        out
    }

    /// Whether `name` is one of this view's properties.
    fn supports(&self, name: &str) -> bool;

    /// Whether this view's properties may be rewritten through
    /// `set_attribute`. Read-only views report `Unsupported`.
    fn writable(&self) -> bool {
        false
    }

    /// Whether this view's attributes persist in the sidecar record.
    fn serializable(&self) -> bool {
        true
    }
}

/// The closed set of view kinds, keyed by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Basic,
    DublinCore,
    Version,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Basic, ViewKind::DublinCore, ViewKind::Version];

    pub fn tag(&self) -> &'static str {
        match self {
            ViewKind::Basic => "basic",
            ViewKind::DublinCore => "dcore",
            ViewKind::Version => "version",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ViewKind> {
        Self::ALL.iter().copied().find(|k| k.tag() == tag)
    }

    /// Constructor registry: build a fully materialized view instance from
    /// the path's store metadata and sidecar content.
    pub fn build(
        &self,
        meta: &EntryMeta,
        sidecar: &BTreeMap<String, String>,
    ) -> Arc<dyn AttributeView> {
        match self {
            ViewKind::Basic => Arc::new(BasicView::new(meta)),
            ViewKind::DublinCore => Arc::new(DublinCoreView::new(sidecar)),
            ViewKind::Version => Arc::new(VersionView::new(sidecar)),
        }
    }
}

/// Basic stat view: entry kind flags, size, timestamps. Computed from store
/// metadata, never persisted to the sidecar.
pub struct BasicView {
    attrs: AttrMap,
}

const BASIC_PROPERTIES: [&str; 5] = [
    "isRegularFile",
    "isDirectory",
    "size",
    "lastModifiedTime",
    "creationTime",
];

impl BasicView {
    pub fn new(meta: &EntryMeta) -> Self {
        let mut attrs = AttrMap::new();
        attrs.insert(
            "isRegularFile".into(),
            PropertyValue::Boolean(!meta.is_dir()),
        );
        attrs.insert("isDirectory".into(), PropertyValue::Boolean(meta.is_dir()));
        attrs.insert("size".into(), PropertyValue::Integer(meta.size as i64));
        if let Some(t) = meta.modified {
            attrs.insert("lastModifiedTime".into(), PropertyValue::Timestamp(t));
        }
        if let Some(t) = meta.created {
            attrs.insert("creationTime".into(), PropertyValue::Timestamp(t));
        }
        Self { attrs }
    }
}

impl AttributeView for BasicView {
    fn name(&self) -> &str {
        "basic"
    }

    fn attributes(&self) -> &AttrMap {
        &self.attrs
    }

    fn supports(&self, name: &str) -> bool {
        BASIC_PROPERTIES.contains(&split_indexed(name).0)
    }

    fn serializable(&self) -> bool {
        false
    }
}

/// Descriptive-metadata view with repeating values, persisted in the sidecar
/// under the `dcore.` namespace.
pub struct DublinCoreView {
    attrs: AttrMap,
}

const DCORE_PROPERTIES: [&str; 15] = [
    "title",
    "author",
    "creator",
    "subject",
    "description",
    "publisher",
    "contributor",
    "type",
    "format",
    "identifier",
    "source",
    "language",
    "relation",
    "coverage",
    "rights",
];

impl DublinCoreView {
    pub fn new(sidecar: &BTreeMap<String, String>) -> Self {
        Self {
            attrs: collect_tagged(sidecar, "dcore", &DCORE_PROPERTIES),
        }
    }
}

impl AttributeView for DublinCoreView {
    fn name(&self) -> &str {
        "dcore"
    }

    fn attributes(&self) -> &AttrMap {
        &self.attrs
    }

    fn supports(&self, name: &str) -> bool {
        DCORE_PROPERTIES.contains(&split_indexed(name).0)
    }

    fn writable(&self) -> bool {
        true
    }
}

/// Per-write version history (author/comment/date records), persisted in the
/// sidecar under the `version.` namespace. Appended by write operations that
/// carry commit information; not writable directly.
pub struct VersionView {
    attrs: AttrMap,
}

const VERSION_PROPERTIES: [&str; 3] = ["author", "comment", "date"];

impl VersionView {
    pub fn new(sidecar: &BTreeMap<String, String>) -> Self {
        Self {
            attrs: collect_tagged(sidecar, "version", &VERSION_PROPERTIES),
        }
    }

    /// Number of recorded history entries.
    pub fn history_len(&self) -> usize {
        self.attrs
            .keys()
            .filter(|k| split_indexed(k).0 == "comment" || split_indexed(k).0 == "author")
            .map(|k| split_indexed(k).1 + 1)
            .max()
            .unwrap_or(0)
    }
}

impl AttributeView for VersionView {
    fn name(&self) -> &str {
        "version"
    }

    fn attributes(&self) -> &AttrMap {
        &self.attrs
    }

    fn supports(&self, name: &str) -> bool {
        VERSION_PROPERTIES.contains(&split_indexed(name).0)
    }
}

/// Pull `tag.name` / `tag.name[i]` keys for the known property set out of raw
/// sidecar content, dropping the tag prefix.
fn collect_tagged(
    sidecar: &BTreeMap<String, String>,
    tag: &str,
    known: &[&str],
) -> AttrMap {
    let prefix = format!("{tag}.");
    let mut attrs = AttrMap::new();
    for (key, value) in sidecar {
        let Some(local) = key.strip_prefix(&prefix) else {
            continue;
        };
        let (base, _) = split_indexed(local);
        if known.contains(&base) {
            attrs.insert(local.to_string(), PropertyValue::Text(value.clone()));
        }
    }
    attrs
}

/// Per-path registry of constructed views.
///
/// Pure in-memory indirection: views are created by the owning IO service
/// and registered here. First registration per tag wins; `clear` discards
/// everything (invoked when the path is deleted or moved).
#[derive(Default)]
pub struct AttrStore {
    views: HashMap<String, Arc<dyn AttributeView>>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&mut self, view: Arc<dyn AttributeView>) {
        self.views.entry(view.name().to_string()).or_insert(view);
    }

    pub fn get_view(&self, tag: &str) -> Option<Arc<dyn AttributeView>> {
        self.views.get(tag).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    pub fn views(&self) -> impl Iterator<Item = &Arc<dyn AttributeView>> {
        self.views.values()
    }

    /// Union of all registered views' attributes, namespaced `tag.name`.
    pub fn merged_attributes(&self) -> AttrMap {
        let mut out = AttrMap::new();
        for view in self.views.values() {
            for (name, value) in view.attributes() {
                out.insert(format!("{}.{}", view.name(), name), value.clone());
            }
        }
        out
    }

    /// Serializable views' attributes in raw sidecar form.
    pub fn to_sidecar_content(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for view in self.views.values() {
            if !view.serializable() {
                continue;
            }
            for (name, value) in view.attributes() {
                out.insert(format!("{}.{}", view.name(), name), value.render());
            }
        }
        out
    }
}
