//! Sidecar record format.
//!
//! Every primary path may have one companion resource — a hidden sibling
//! named `.{filename}` — holding its extended attributes as flat
//! line-oriented `key=value` text. Keys are namespaced `viewTag.property`,
//! with repeating values addressed `viewTag.property[i]`. Absence of the
//! record means an empty attribute set.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::store::{FileStore, StorePath};

/// Sidecar content: raw, flat key/value text pairs.
pub type SidecarContent = BTreeMap<String, String>;

/// The companion resource location for `path`, or `None` for the store root.
pub fn sidecar_path(path: &StorePath) -> Option<StorePath> {
    path.file_name().map(|name| path.sibling(&format!(".{name}")))
}

/// Whether `path` itself names a sidecar record.
pub fn is_sidecar(path: &StorePath) -> bool {
    path.is_hidden()
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize content in deterministic (sorted-key) line order.
pub fn render(content: &SidecarContent) -> String {
    let mut out = String::new();
    for (key, value) in content {
        out.push_str(key);
        out.push('=');
        out.push_str(&escape(value));
        out.push('\n');
    }
    out
}

/// Parse sidecar bytes. Malformed lines (no `=`) are ignored rather than
/// failing the whole record.
pub fn parse(bytes: &[u8]) -> SidecarContent {
    let text = String::from_utf8_lossy(bytes);
    let mut content = SidecarContent::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            content.insert(key.trim().to_string(), unescape(value));
        }
    }
    content
}

/// Load the sidecar record for `path`. Absent record ⇒ empty content.
pub fn load(store: &dyn FileStore, path: &StorePath) -> Result<SidecarContent> {
    let Some(side) = sidecar_path(path) else {
        return Ok(SidecarContent::new());
    };
    if !store.exists(&side) {
        return Ok(SidecarContent::new());
    }
    Ok(parse(&store.read(&side)?))
}

/// Whether `path` currently has a sidecar record.
pub fn exists(store: &dyn FileStore, path: &StorePath) -> bool {
    sidecar_path(path).map(|s| store.exists(&s)).unwrap_or(false)
}

/// Write the sidecar record for `path`, replacing any previous content.
/// Empty content removes the record instead of leaving an empty file.
pub fn save(store: &dyn FileStore, path: &StorePath, content: &SidecarContent) -> Result<()> {
    let Some(side) = sidecar_path(path) else {
        return Err(Error::InvalidArgument(
            "store root has no sidecar record".into(),
        ));
    };
    if content.is_empty() {
        if store.exists(&side) {
            store.remove(&side)?;
        }
        return Ok(());
    }
    store.write(&side, render(content).as_bytes())
}

/// Best-effort removal of the sidecar record; failures are logged, never
/// propagated, because primary deletion has already succeeded.
pub fn remove_best_effort(store: &dyn FileStore, path: &StorePath) {
    let Some(side) = sidecar_path(path) else {
        return;
    };
    if store.exists(&side) {
        if let Err(err) = store.remove(&side) {
            tracing::warn!(path = %path.uri(), error = %err, "failed to remove sidecar record");
        }
    }
}
