/*!
Storage adapters for save file bytes.

The save file decides *what* bytes to write (serialized and possibly
encrypted JSON); the storage adapter decides *how* they reach the disk.
Adapters are shared with background workers, so they must be `Send + Sync`.
*/

pub mod local;

use std::path::Path;

use crate::Result;

/// Storage abstraction for saving and loading save file data
pub trait StorageAdapter: Send + Sync {
    /// Write `data` to `path`, replacing any previous content in one step
    ///
    /// Missing parent directories are created.
    fn save(&self, data: &[u8], path: &Path) -> Result<()>;

    /// Read the full content stored at `path`
    fn load(&self, path: &Path) -> Result<Vec<u8>>;

    /// Check if anything is stored at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Remove whatever is stored at `path`; removing nothing is not an error
    fn delete(&self, path: &Path) -> Result<()>;
}

pub use local::LocalFileStorage;

/// Memory-based storage adapter for testing
///
/// Stores file contents in a HashMap keyed by path. Clones share the same
/// backing map, so a test can keep a handle and inspect what was written.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<std::path::PathBuf, Vec<u8>>>>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes stored at `path`, if any
    pub fn raw(&self, path: &Path) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(path).cloned()
    }

    /// Overwrite the bytes at `path` directly
    pub fn put_raw(&self, path: &Path, bytes: &[u8]) {
        self.data
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), bytes.to_vec());
    }
}

#[cfg(test)]
impl StorageAdapter for MemoryStorage {
    fn save(&self, data: &[u8], path: &Path) -> Result<()> {
        let mut storage = self.data.lock().unwrap();
        storage.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        let storage = self.data.lock().unwrap();
        storage.get(path).cloned().ok_or_else(|| {
            crate::SaveError::storage(format!("Save file not found: {}", path.display()))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        let storage = self.data.lock().unwrap();
        storage.contains_key(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut storage = self.data.lock().unwrap();
        storage.remove(path);
        Ok(())
    }
}
