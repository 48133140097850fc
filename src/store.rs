//! Content store: key/value persistence for cached markup, TOC pages, the Work record and
//! compiled output. Keys are relative, `/`-separated paths.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid store key {key:?}: keys must be relative paths without '..'")]
    InvalidKey { key: String },

    #[error("Cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persistence used by the sync engine. Writes of different keys are independent.
pub trait ContentStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// None when the key does not exist.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns whether something was deleted.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Human-readable location, for messages.
    fn location(&self) -> String {
        "<memory>".to_string()
    }

    fn save_text(&self, key: &str, text: &str) -> Result<(), StoreError> {
        self.save(key, text.as_bytes())
    }

    /// Loads as UTF-8, replacing invalid sequences.
    fn load_text(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .load(key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Contents of `{prefix}_0.html`, `{prefix}_1.html`, … up to the first missing index.
    fn list_ordered_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        while let Some(text) = self.load_text(&numbered_key(prefix, out.len()))? {
            out.push(text);
        }
        Ok(out)
    }

    /// Store `text` under the next free index of `prefix`; returns that index.
    fn append_numbered(&self, prefix: &str, text: &str) -> Result<usize, StoreError> {
        let mut n = 0;
        while self.exists(&numbered_key(prefix, n))? {
            n += 1;
        }
        self.save_text(&numbered_key(prefix, n), text)?;
        Ok(n)
    }

    /// Delete `{prefix}_0.html` onwards until the first missing index. Returns how many went.
    fn clear_numbered(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut n = 0;
        while self.delete(&numbered_key(prefix, n))? {
            n += 1;
        }
        Ok(n)
    }
}

pub fn numbered_key(prefix: &str, n: usize) -> String {
    format!("{}_{}.html", prefix, n)
}

/// Store rooted at one directory on disk (one Work per directory).
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `key`.
    pub fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

impl ContentStore for FileStore {
    /// Writes through a sibling temp file and a rename, so a crash never leaves a torn file.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(|e| StoreError::Io {
            action: "write",
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            action: "rename into",
            path,
            source: e,
        })
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                action: "read",
                path,
                source: e,
            }),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io {
                action: "delete",
                path,
                source: e,
            }),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path(key)?.is_file())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// In-memory store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }
}

impl ContentStore for MemoryStore {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.borrow_mut().remove(key).is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.borrow().contains_key(key))
    }
}
