//! The indexable projection of one path.
//!
//! A [`Document`] carries a stable identifier, a type tag, the path's natural
//! key, and a flat property set. The identifier is a one-way hash of
//! `type|key`, so re-indexing the same path always resolves to the same
//! entry (upsert semantics, no duplicate accumulation).

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::attrs::{split_indexed, AttrMap, PropertyValue};

/// Type tag used for path documents.
pub const PATH_TYPE: &str = "Path";

/// Deterministic document identifier: lowercase hex SHA-256 over the UTF-8
/// bytes of `type|key`.
pub fn doc_id(type_name: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Identity of a document without its properties; enough for delete/rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocKey {
    pub type_name: String,
    pub key: String,
}

impl DocKey {
    pub fn for_path(key: &str) -> Self {
        Self {
            type_name: PATH_TYPE.to_string(),
            key: key.to_string(),
        }
    }

    pub fn id(&self) -> String {
        doc_id(&self.type_name, &self.key)
    }
}

/// One named property of a document.
#[derive(Debug, Clone)]
pub struct DocProperty {
    pub name: String,
    pub value: PropertyValue,
    pub searchable: bool,
}

/// The index projection of one path.
#[derive(Debug, Clone)]
pub struct Document {
    pub type_name: String,
    pub key: String,
    pub properties: Vec<DocProperty>,
}

impl Document {
    /// Build a path document from merged attribute-view output. All
    /// properties are flagged searchable, matching the indexing layer's
    /// conversion rule.
    pub fn from_attrs(key: &str, attrs: &AttrMap) -> Self {
        let properties = attrs
            .iter()
            .map(|(name, value)| DocProperty {
                name: name.clone(),
                value: value.clone(),
                searchable: true,
            })
            .collect();
        Self {
            type_name: PATH_TYPE.to_string(),
            key: key.to_string(),
            properties,
        }
    }

    pub fn id(&self) -> String {
        doc_id(&self.type_name, &self.key)
    }

    pub fn doc_key(&self) -> DocKey {
        DocKey {
            type_name: self.type_name.clone(),
            key: self.key.clone(),
        }
    }

    /// Searchable properties folded into a nested JSON object: dotted
    /// namespaces become nesting, `name[i]` repeats become arrays.
    pub fn searchable_json(&self) -> Map<String, Value> {
        fold_properties(self.properties.iter().filter(|p| p.searchable))
    }

    /// Stored-only properties, same folding.
    pub fn stored_json(&self) -> Map<String, Value> {
        fold_properties(self.properties.iter().filter(|p| !p.searchable))
    }
}

fn value_to_json(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Text(s) => Value::String(s.clone()),
        PropertyValue::Integer(i) => Value::from(*i),
        PropertyValue::Decimal(d) => Value::from(*d),
        PropertyValue::Boolean(b) => Value::Bool(*b),
        PropertyValue::Timestamp(t) => Value::String(t.to_rfc3339()),
    }
}

fn fold_properties<'a>(props: impl Iterator<Item = &'a DocProperty>) -> Map<String, Value> {
    let mut root = Map::new();
    for prop in props {
        let (base, idx) = split_indexed(&prop.name);
        let segments: Vec<&str> = base.split('.').collect();
        insert_nested(&mut root, &segments, idx, value_to_json(&prop.value));
    }
    root
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], idx: usize, value: Value) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        match map.get_mut(*head) {
            None if idx == 0 => {
                map.insert(head.to_string(), value);
            }
            None => {
                let mut arr = vec![Value::Null; idx];
                arr.push(value);
                map.insert(head.to_string(), Value::Array(arr));
            }
            Some(Value::Array(arr)) => {
                if arr.len() <= idx {
                    arr.resize(idx + 1, Value::Null);
                }
                arr[idx] = value;
            }
            Some(existing) => {
                // Scalar already present; promote to an array on repeat.
                let first = existing.take();
                let mut arr = vec![first];
                if arr.len() <= idx {
                    arr.resize(idx + 1, Value::Null);
                }
                arr[idx] = value;
                map.insert(head.to_string(), Value::Array(arr));
            }
        }
        return;
    }
    let child = map
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(child_map) = child {
        insert_nested(child_map, rest, idx, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn id_is_stable_and_distinct() {
        let a = doc_id(PATH_TYPE, "repo:/a/b.txt");
        assert_eq!(a, doc_id(PATH_TYPE, "repo:/a/b.txt"));
        assert_ne!(a, doc_id(PATH_TYPE, "repo:/a/c.txt"));
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn folds_namespaces_and_repeats() {
        let mut attrs: AttrMap = BTreeMap::new();
        attrs.insert("dcore.author".into(), PropertyValue::Text("Ann".into()));
        attrs.insert("dcore.author[1]".into(), PropertyValue::Text("Bob".into()));
        attrs.insert("basic.size".into(), PropertyValue::Integer(7));

        let doc = Document::from_attrs("repo:/f.txt", &attrs);
        let json = Value::Object(doc.searchable_json());

        assert_eq!(json["dcore"]["author"][0], "Ann");
        assert_eq!(json["dcore"]["author"][1], "Bob");
        assert_eq!(json["basic"]["size"], 7);
    }

    #[test]
    fn stored_only_properties_stay_out_of_search_json() {
        let doc = Document {
            type_name: PATH_TYPE.into(),
            key: "repo:/f".into(),
            properties: vec![DocProperty {
                name: "dcore.title".into(),
                value: PropertyValue::Text("T".into()),
                searchable: false,
            }],
        };
        assert!(doc.searchable_json().is_empty());
        assert!(!doc.stored_json().is_empty());
    }
}
