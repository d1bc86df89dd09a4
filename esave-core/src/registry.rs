/*!
Directory of open save files plus a manifest for rehydrating them.

The registry is an ordinary value: create it once at startup with
[`SaveRegistry::open`], pass it to whatever needs save files, and call
[`SaveRegistry::close`] on shutdown. Its manifest is itself a [`SaveFile`]
whose keys are file names and whose values are the [`SaveFileDescriptor`]s
of every registered save, so the next `open` can bring them all back.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{SaveFileDescriptor, SaveRoots};
use crate::container::SaveFile;
use crate::operation::{Dispatcher, Operation, OperationState};
use crate::storage::{LocalFileStorage, StorageAdapter};
use crate::{Result, SaveError};

/// File name of the default manifest
pub const MANIFEST_FILE_NAME: &str = "SavePaths";
/// Sub-path of the default manifest below the persistent data root
pub const MANIFEST_PATH: &str = "ESave";

/// Descriptor of the default manifest: `{persistent}/ESave/SavePaths.json`
pub fn default_manifest_descriptor() -> SaveFileDescriptor {
    SaveFileDescriptor::new(MANIFEST_FILE_NAME)
        .with_path(MANIFEST_PATH)
        .without_registry()
}

/// Open save files keyed by file name
pub struct SaveRegistry {
    roots: SaveRoots,
    dispatcher: Dispatcher,
    storage: Arc<dyn StorageAdapter>,
    manifest: SaveFile,
    saves: BTreeMap<String, SaveFile>,
}

impl std::fmt::Debug for SaveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveRegistry")
            .field("manifest", &self.manifest.full_path())
            .field("saves", &self.saves.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SaveRegistry {
    /// Open the registry with the default manifest on the local filesystem
    pub fn open(roots: SaveRoots, dispatcher: Dispatcher) -> Result<Self> {
        Self::open_with_manifest(roots, default_manifest_descriptor(), dispatcher)
    }

    /// Open the registry with a custom manifest location
    pub fn open_with_manifest(
        roots: SaveRoots,
        manifest: SaveFileDescriptor,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        Self::open_with_storage(roots, manifest, dispatcher, Arc::new(LocalFileStorage::new()))
    }

    /// Open the registry on a custom storage adapter
    ///
    /// The manifest is loaded synchronously. Every listed save whose file
    /// still exists is reopened; entries whose file is gone are dropped
    /// from the manifest.
    pub fn open_with_storage(
        roots: SaveRoots,
        manifest: SaveFileDescriptor,
        dispatcher: Dispatcher,
        storage: Arc<dyn StorageAdapter>,
    ) -> Result<Self> {
        let manifest = SaveFile::with_storage(
            manifest.in_background(false).without_registry(),
            roots.clone(),
            dispatcher.clone(),
            Arc::clone(&storage),
        )?;

        if let Some(op) = manifest.load(true) {
            if op.state() == OperationState::Failed {
                return Err(SaveError::storage(format!(
                    "Failed to load save manifest {}: {}",
                    manifest.full_path().display(),
                    op.error().unwrap_or_default()
                )));
            }
        }

        let mut registry = Self {
            roots,
            dispatcher,
            storage,
            manifest,
            saves: BTreeMap::new(),
        };
        registry.rehydrate()?;
        Ok(registry)
    }

    fn rehydrate(&mut self) -> Result<()> {
        let mut stale = false;

        for (name, descriptor) in self.manifest.entries_of_type::<SaveFileDescriptor>() {
            let path = descriptor.full_path(&self.roots);
            if !self.storage.exists(&path) {
                info!(name = %name, path = %path.display(), "Dropping registry entry for missing file");
                self.manifest.delete(&name);
                stale = true;
                continue;
            }

            match self.build(descriptor) {
                Ok(file) => {
                    file.load(true);
                    self.saves.insert(name, file);
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "Dropping unusable registry entry");
                    self.manifest.delete(&name);
                    stale = true;
                }
            }
        }

        if stale {
            self.write_manifest()?;
        }
        debug!(saves = self.saves.len(), "Registry rehydrated");
        Ok(())
    }

    fn build(&self, descriptor: SaveFileDescriptor) -> Result<SaveFile> {
        SaveFile::with_storage(
            descriptor,
            self.roots.clone(),
            self.dispatcher.clone(),
            Arc::clone(&self.storage),
        )
    }

    /// Write the manifest synchronously
    fn write_manifest(&self) -> Result<()> {
        match self.manifest.save(true) {
            Some(op) if op.state() == OperationState::Completed => Ok(()),
            Some(op) => Err(SaveError::storage(format!(
                "Failed to write save manifest {}: {}",
                self.manifest.full_path().display(),
                op.error().unwrap_or_default()
            ))),
            None => Err(SaveError::storage("Save manifest write was not started")),
        }
    }

    /// Add a descriptor to the manifest; the entry is rolled back if the write fails
    fn record_in_manifest(&self, descriptor: &SaveFileDescriptor) -> Result<()> {
        if !descriptor.add_to_registry {
            return Ok(());
        }

        let name = descriptor.file_name.as_str();
        let previous = self.manifest.record(name);
        self.manifest.set(name, descriptor.clone());
        if let Err(e) = self.write_manifest() {
            match previous {
                Some(record) => self.manifest.set_record(name, record),
                None => {
                    self.manifest.delete(name);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Open a save file and register it
    ///
    /// If a save with the same file name is already registered, that one is
    /// returned unchanged. The file is loaded (or created) right away.
    pub fn create_save(&mut self, descriptor: SaveFileDescriptor) -> Result<&SaveFile> {
        let name = descriptor.file_name.clone();
        if self.saves.contains_key(&name) {
            warn!(name = %name, "Save file already registered, returning existing one");
        } else {
            let file = self.build(descriptor)?;
            file.load(true);
            self.record_in_manifest(file.descriptor())?;
            self.saves.insert(name.clone(), file);
        }

        self.saves
            .get(&name)
            .ok_or_else(|| SaveError::KeyNotFound(name))
    }

    /// Register an already constructed save file
    ///
    /// Returns `Ok(false)` if the name is taken. A failed manifest write
    /// leaves the save unregistered.
    pub fn add_save(&mut self, file: SaveFile) -> Result<bool> {
        let name = file.file_name().to_string();
        if self.saves.contains_key(&name) {
            warn!(name = %name, "Save file already registered");
            return Ok(false);
        }

        self.record_in_manifest(file.descriptor())?;
        self.saves.insert(name, file);
        Ok(true)
    }

    /// Deregister a save file without touching its file on disk
    ///
    /// Returns `Ok(None)` if no save of that name was registered. A failed
    /// manifest write leaves the save registered.
    pub fn remove_save(&mut self, name: &str) -> Result<Option<SaveFile>> {
        if !self.saves.contains_key(name) {
            warn!(name, "Save file not registered, nothing removed");
            return Ok(None);
        }

        if let Some(record) = self.manifest.record(name) {
            self.manifest.delete(name);
            if let Err(e) = self.write_manifest() {
                self.manifest.set_record(name, record);
                return Err(e);
            }
        }
        Ok(self.saves.remove(name))
    }

    /// Delete a save file from disk and deregister it
    ///
    /// Returns `Ok(false)` if no save of that name was registered.
    pub fn delete_save(&mut self, name: &str) -> Result<bool> {
        match self.remove_save(name)? {
            Some(file) => {
                file.delete_file()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.saves.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SaveFile> {
        self.saves.get(name)
    }

    /// Mutable access, for changing a save's descriptor
    ///
    /// Changing the file name through this handle does not re-key the
    /// registry; remove and add the save instead.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SaveFile> {
        self.saves.get_mut(name)
    }

    /// The save at `index` in file name order
    pub fn get_at_index(&self, index: usize) -> Option<&SaveFile> {
        let file = self.saves.values().nth(index);
        if file.is_none() {
            warn!(index, count = self.saves.len(), "Save index out of range");
        }
        file
    }

    pub fn save_count(&self) -> usize {
        self.saves.len()
    }

    /// Registered file names in sorted order
    pub fn file_names(&self) -> Vec<String> {
        self.saves.keys().cloned().collect()
    }

    /// Iterate over registered saves in file name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SaveFile)> {
        self.saves.iter().map(|(name, file)| (name.as_str(), file))
    }

    /// Start a save on every registered file
    ///
    /// Files with a save still in flight are skipped.
    pub fn save_all(&self) -> Vec<Operation> {
        self.saves.values().filter_map(|file| file.save(false)).collect()
    }

    /// The manifest save file
    pub fn manifest(&self) -> &SaveFile {
        &self.manifest
    }

    pub fn roots(&self) -> &SaveRoots {
        &self.roots
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Wait for outstanding operations and write the manifest one last time
    ///
    /// Saves are not flushed; call [`save_all`](SaveRegistry::save_all)
    /// first if that is wanted.
    pub fn close(self) -> Result<()> {
        for file in self.saves.values() {
            file.wait_for_operations();
        }
        self.manifest.wait_for_operations();
        self.write_manifest()?;

        debug!(saves = self.saves.len(), "Registry closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory storage that can be told to reject manifest writes
    #[derive(Clone, Default)]
    struct FlakyManifestStorage {
        inner: MemoryStorage,
        fail_manifest: Arc<AtomicBool>,
    }

    impl StorageAdapter for FlakyManifestStorage {
        fn save(&self, data: &[u8], path: &Path) -> Result<()> {
            if self.fail_manifest.load(Ordering::SeqCst) && path.ends_with("SavePaths.json") {
                return Err(SaveError::storage("disk full"));
            }
            self.inner.save(data, path)
        }

        fn load(&self, path: &Path) -> Result<Vec<u8>> {
            self.inner.load(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn delete(&self, path: &Path) -> Result<()> {
            self.inner.delete(path)
        }
    }

    fn open(storage: &MemoryStorage) -> SaveRegistry {
        SaveRegistry::open_with_storage(
            SaveRoots::single("/game"),
            default_manifest_descriptor(),
            Dispatcher::new(),
            Arc::new(storage.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_open_creates_manifest() {
        let storage = MemoryStorage::new();
        let registry = open(&storage);

        assert_eq!(registry.save_count(), 0);
        assert_eq!(
            registry.manifest().full_path(),
            Path::new("/game/ESave/SavePaths.json")
        );
        assert!(storage.raw(Path::new("/game/ESave/SavePaths.json")).is_some());
    }

    #[test]
    fn test_create_save_registers_and_records_manifest() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);

        let file = registry
            .create_save(SaveFileDescriptor::new("Slot1").with_path("Saves"))
            .unwrap();
        file.set("score", 42i32);
        file.save(false);

        assert!(registry.contains_key("Slot1"));
        assert!(registry.manifest().has_key("Slot1"));
        assert_eq!(registry.file_names(), vec!["Slot1".to_string()]);
    }

    #[test]
    fn test_unregistered_descriptor_stays_out_of_manifest() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);

        registry
            .create_save(SaveFileDescriptor::new("Scratch").without_registry())
            .unwrap();
        assert!(registry.contains_key("Scratch"));
        assert!(!registry.manifest().has_key("Scratch"));
    }

    #[test]
    fn test_rehydrate_restores_saves() {
        let storage = MemoryStorage::new();
        {
            let mut registry = open(&storage);
            let file = registry
                .create_save(SaveFileDescriptor::new("Slot1").with_path("Saves"))
                .unwrap();
            file.set("score", 42i32);
            file.save(false);
            registry.close().unwrap();
        }

        let registry = open(&storage);
        let file = registry.get("Slot1").unwrap();
        assert_eq!(file.get("score", 0i32), 42);
    }

    #[test]
    fn test_rehydrate_drops_missing_files() {
        let storage = MemoryStorage::new();
        {
            let mut registry = open(&storage);
            registry.create_save(SaveFileDescriptor::new("Gone")).unwrap();
            registry.close().unwrap();
        }
        storage.delete(Path::new("/game/Gone.json")).unwrap();

        let registry = open(&storage);
        assert!(!registry.contains_key("Gone"));
        assert!(!registry.manifest().has_key("Gone"));
    }

    #[test]
    fn test_add_and_remove_warn_cases() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);
        registry.create_save(SaveFileDescriptor::new("Slot1")).unwrap();

        let duplicate = registry
            .build(SaveFileDescriptor::new("Slot1"))
            .unwrap();
        assert!(!registry.add_save(duplicate).unwrap());
        assert!(registry.remove_save("Nope").unwrap().is_none());

        let removed = registry.remove_save("Slot1").unwrap().unwrap();
        assert_eq!(removed.file_name(), "Slot1");
        assert!(!registry.manifest().has_key("Slot1"));
        assert!(removed.file_exists());
    }

    #[test]
    fn test_delete_save_removes_file() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);
        registry.create_save(SaveFileDescriptor::new("Slot1")).unwrap();
        assert!(storage.raw(Path::new("/game/Slot1.json")).is_some());

        assert!(registry.delete_save("Slot1").unwrap());
        assert!(!registry.delete_save("Slot1").unwrap());
        assert!(storage.raw(Path::new("/game/Slot1.json")).is_none());
        assert!(!registry.manifest().has_key("Slot1"));
    }

    #[test]
    fn test_get_at_index_in_name_order() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);
        registry.create_save(SaveFileDescriptor::new("B")).unwrap();
        registry.create_save(SaveFileDescriptor::new("A")).unwrap();

        assert_eq!(registry.get_at_index(0).unwrap().file_name(), "A");
        assert_eq!(registry.get_at_index(1).unwrap().file_name(), "B");
        assert!(registry.get_at_index(2).is_none());
    }

    #[test]
    fn test_manifest_write_failure_is_reported() {
        let storage = FlakyManifestStorage::default();
        let mut registry = SaveRegistry::open_with_storage(
            SaveRoots::single("/game"),
            default_manifest_descriptor(),
            Dispatcher::new(),
            Arc::new(storage.clone()),
        )
        .unwrap();
        registry.create_save(SaveFileDescriptor::new("Kept")).unwrap();

        storage.fail_manifest.store(true, Ordering::SeqCst);

        let err = registry
            .create_save(SaveFileDescriptor::new("Slot1"))
            .unwrap_err();
        assert!(matches!(err, SaveError::Storage(_)));
        assert!(!registry.contains_key("Slot1"));
        assert!(!registry.manifest().has_key("Slot1"));

        assert!(registry.remove_save("Kept").is_err());
        assert!(registry.contains_key("Kept"));
        assert!(registry.manifest().has_key("Kept"));

        assert!(registry.close().is_err());
    }

    #[test]
    fn test_save_all() {
        let storage = MemoryStorage::new();
        let mut registry = open(&storage);
        registry.create_save(SaveFileDescriptor::new("A")).unwrap();
        registry.create_save(SaveFileDescriptor::new("B")).unwrap();

        let ops = registry.save_all();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.state() == OperationState::Completed));
    }
}
