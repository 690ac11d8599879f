use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration for an indexed store setup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// Index engine settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding the index segments. `None` keeps the index in RAM.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// File persisting the metamodel between runs. `None` keeps it in memory.
    #[serde(default)]
    pub metamodel_path: Option<PathBuf>,
    /// Index writer memory budget in megabytes.
    #[serde(default = "default_writer_heap_mb")]
    pub writer_heap_mb: usize,
}

fn default_writer_heap_mb() -> usize {
    50
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: None,
            metamodel_path: None,
            writer_heap_mb: default_writer_heap_mb(),
        }
    }
}

/// Background change-watcher settings.
#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    /// Bound on how long the drain loop waits for the next event batch
    /// before re-checking cancellation, in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Paths matching any of these globs are never indexed by the watcher
    /// or the batch indexer.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_poll_ms() -> u64 {
    200
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            exclude_globs: Vec::new(),
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::from_io(e, &path.display().to_string()))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::InvalidArgument(format!("bad config file: {e}")))?;

    if config.index.writer_heap_mb == 0 {
        return Err(Error::InvalidArgument(
            "index.writer_heap_mb must be > 0".into(),
        ));
    }
    if config.watcher.poll_ms == 0 {
        return Err(Error::InvalidArgument("watcher.poll_ms must be > 0".into()));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.index.writer_heap_mb, 50);
        assert_eq!(config.watcher.poll_ms, 200);
        assert!(config.index.path.is_none());
    }

    #[test]
    fn rejects_zero_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecarfs.toml");
        std::fs::write(&path, "[watcher]\npoll_ms = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
