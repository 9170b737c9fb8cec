//! Preloaded library module cache.
//!
//! The cache is populated once at startup by a recursive scan of the
//! library root. Only files with the script extension are kept; the
//! cache key is the last two path segments joined with the OS
//! separator, so `…/libs/util.lua` is served as `libs/util.lua` and
//! scripts request it by exactly that name.
//!
//! The cache is shared by every engine through the `require` hook.
//! Reads take the shared lock; `update` re-reads a single file from
//! disk and briefly takes the exclusive lock to swap the entry in. No
//! disk I/O happens under the shared lock.

use crate::error::EngineError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// File extension of cacheable library modules.
pub const SCRIPT_EXTENSION: &str = "lua";

/// Process-wide library source cache.
#[derive(Debug)]
pub struct ModuleCache {
    root: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl ModuleCache {
    /// Scans `root` recursively and caches every script file found.
    ///
    /// Unreadable files and unwalkable directories are logged and
    /// skipped; an empty or missing root yields an empty cache.
    #[must_use]
    pub fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut entries = HashMap::new();

        for entry in walkdir::WalkDir::new(&root) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION) {
                continue;
            }
            let Some(key) = cache_key(path) else {
                tracing::warn!(path = %path.display(), "skipping file with non-utf8 path");
                continue;
            };
            match std::fs::read_to_string(path) {
                Ok(source) => {
                    entries.insert(key, source);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable library file");
                }
            }
        }

        tracing::info!(root = %root.display(), modules = entries.len(), "library cache loaded");
        Self {
            root,
            entries: RwLock::new(entries),
        }
    }

    /// Read-only lookup of a cached module.
    ///
    /// # Errors
    ///
    /// [`EngineError::ModuleNotCached`] when the key is unknown.
    pub fn get(&self, key: &str) -> Result<String, EngineError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::ModuleNotCached(key.to_string()))
    }

    /// Lookup used by the `require` hook: the name a script passes to
    /// `require` is the cache key, verbatim.
    ///
    /// # Errors
    ///
    /// [`EngineError::ModuleNotCached`] when the name is unknown.
    pub fn lookup_for_require(&self, name: &str) -> Result<String, EngineError> {
        self.get(name)
    }

    /// Re-reads `<root>/<key>` from disk and replaces the cache entry.
    ///
    /// Returns the fresh content.
    ///
    /// # Errors
    ///
    /// [`EngineError::ModuleRead`] when the file cannot be read; the
    /// existing entry is left untouched in that case.
    pub fn update(&self, key: &str) -> Result<String, EngineError> {
        let path = self.root.join(key);
        let source = std::fs::read_to_string(&path).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "library refresh failed");
            EngineError::ModuleRead(path.display().to_string())
        })?;
        self.entries
            .write()
            .insert(key.to_string(), source.clone());
        Ok(source)
    }

    /// Number of cached modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no modules are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The library root this cache was loaded from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Last two path segments joined with the OS separator.
fn cache_key(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    let dir = path.parent()?.file_name()?.to_str()?;
    Some(format!("{dir}{MAIN_SEPARATOR}{file}"))
}
