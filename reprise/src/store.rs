//! Named payload storage.
//!
//! Captures are staged as plain files: `save` copies a captured payload into
//! the save folder under a short name, `load` finds it again either by path or
//! by that name. Loaded payloads are cached for the lifetime of the store.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid payload name {0:?}")]
    InvalidName(String),
}

/// Somewhere payloads can be stashed under a name and read back.
pub trait PayloadStore: Send + Sync {
    /// Copy the file at `source` into the store as `name`.
    fn save(&self, source: &Path, name: &str) -> Result<(), StoreError>;

    /// The payload stored as `name`, or `None` if there is none.
    fn load(&self, name: &str) -> Result<Option<Arc<str>>, StoreError>;
}

/// [`PayloadStore`] backed by a directory, `~/.capture/save/` by default.
#[derive(Debug)]
pub struct FsPayloadStore {
    root: PathBuf,
    cache: Mutex<HashMap<String, Arc<str>>>,
}

impl FsPayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store rooted at `$HOME/.capture/save` (`%USERPROFILE%` on Windows),
    /// falling back to the working directory.
    pub fn in_home() -> Self {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_default();
        Self::new(home.join(".capture").join("save"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        let direct = Path::new(name);
        if direct.is_file() {
            return Ok(Some(fs::read_to_string(direct)?));
        }
        let saved = self.root.join(name);
        if saved.is_file() {
            return Ok(Some(fs::read_to_string(saved)?));
        }
        Ok(None)
    }
}

impl PayloadStore for FsPayloadStore {
    fn save(&self, source: &Path, name: &str) -> Result<(), StoreError> {
        let plain = Path::new(name).file_name().is_some_and(|f| f == name);
        if name.is_empty() || !plain {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        fs::create_dir_all(&self.root)?;
        fs::copy(source, self.root.join(name))?;
        // A later load must see the new content.
        self.cache.lock().remove(name);
        tracing::debug!(name, root = %self.root.display(), "payload saved");
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<Arc<str>>, StoreError> {
        if let Some(hit) = self.cache.lock().get(name) {
            return Ok(Some(Arc::clone(hit)));
        }
        let Some(content) = self.read(name)? else {
            return Ok(None);
        };
        let content: Arc<str> = content.into();
        self.cache
            .lock()
            .insert(name.to_string(), Arc::clone(&content));
        Ok(Some(content))
    }
}
