//! Endpoint abstraction for chunk, hierarchy and manifest storage.
//!
//! The core consumes a small key-value contract; apps provide the backing
//! store (local filesystem, S3, GCS, ...). Writes are full-object puts —
//! atomic at the endpoint layer — and re-writing identical content is
//! idempotent, which is what makes partial and resumed builds safe.
//!
//! Two implementations ship here:
//! - `MemoryEndpoint`: `RwLock<HashMap>`, for tests and in-memory builds
//! - `FileEndpoint`: local filesystem under a base directory

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Key-value storage contract the core consumes.
pub trait Endpoint: Debug + Send + Sync {
    /// Read the object at `key`. Missing objects are `Error::NotFound`;
    /// transient failures are `Error::EndpointIo`.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write the object at `key` (atomic full-object put; overwrites
    /// permitted).
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Check whether an object exists at `key`.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List all object keys under `prefix`. May be expensive for large
    /// prefixes; the core only lists bounded namespaces (hierarchy blocks,
    /// source files).
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Copy `src` to `dst`. The default falls back to get + put; backends
    /// with a native server-side copy should override.
    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let bytes = self.get(src)?;
        self.put(dst, &bytes)
    }
}

/// Join a key prefix and a relative object name.
pub fn join_key(prefix: &str, rel: &str) -> String {
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), rel)
    }
}

// ============================================================================
// MemoryEndpoint
// ============================================================================

/// A simple in-memory endpoint for testing and ephemeral builds.
///
/// Cloning shares the underlying map, so a clone observes all writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpoint {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Endpoint for MemoryEndpoint {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// FileEndpoint
// ============================================================================

/// Local-filesystem endpoint rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FileEndpoint {
    base: PathBuf,
}

impl FileEndpoint {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FileEndpoint { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve a key to a path under the base directory. Absolute paths
    /// and parent-directory components are rejected so a key can never
    /// escape the base.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let p = Path::new(key);
        if p.is_absolute()
            || p.components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::invalid_input(format!(
                "invalid endpoint key '{}': must be relative without '..'",
                key
            )));
        }
        Ok(self.base.join(p))
    }
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> Error {
    Error::endpoint_io(format!("{} {}: {}", context, path.display(), e))
}

impl Endpoint for FileEndpoint {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(key)
            } else {
                io_err("failed to read", &path, e)
            }
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err("failed to create", parent, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| io_err("failed to write", &path, e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match std::fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("failed to stat", &path, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // The prefix may name a directory or a partial object name; walk
        // from the nearest existing directory and filter by string prefix.
        let full = self.base.join(prefix);
        let start = if full.is_dir() {
            full
        } else {
            match full.parent() {
                Some(p) if p.starts_with(&self.base) && p.is_dir() => p.to_path_buf(),
                _ => return Ok(Vec::new()),
            }
        };

        let mut results = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("failed to list", &dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| io_err("failed to list", &dir, e))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.base) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }
}
