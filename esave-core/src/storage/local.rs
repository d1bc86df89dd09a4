/*!
Local filesystem storage adapter implementation.
*/

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use super::StorageAdapter;
use crate::{Result, SaveError};

/// Local filesystem storage adapter
///
/// Writes go to a temporary file in the destination directory which is then
/// renamed over the target, so readers never observe a half-written save.
/// Parent directories are created on demand.
///
/// # Example
/// ```rust
/// use esave_core::storage::{LocalFileStorage, StorageAdapter};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("Saves/Slot1.json");
/// let storage = LocalFileStorage::new();
/// storage.save(b"{}", &path)?;
/// assert_eq!(storage.load(&path)?, b"{}");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct LocalFileStorage;

impl LocalFileStorage {
    pub fn new() -> Self {
        Self
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    SaveError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl StorageAdapter for LocalFileStorage {
    fn save(&self, data: &[u8], path: &Path) -> Result<()> {
        self.ensure_parent_dir(path)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let write_err = |e: std::io::Error| {
            SaveError::storage(format!(
                "Failed to write save file {}: {}",
                path.display(),
                e
            ))
        };

        let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
        temp.write_all(data).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(path).map_err(|e| write_err(e.error))?;

        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| {
            SaveError::storage(format!(
                "Failed to read save file {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path).map_err(|e| {
                SaveError::storage(format!(
                    "Failed to delete save file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        Ok(())
    }
}
