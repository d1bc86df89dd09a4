/*!
Save files: typed key-value stores mirrored to one file on disk.

A [`SaveFile`] keeps every record in memory. `set`/`get`/`delete` only touch
memory; [`SaveFile::save`] writes the whole map out in one atomic write and
[`SaveFile::load`] replaces the map with what is on disk. Both return an
[`Operation`] that runs inline or on a background worker depending on the
descriptor.

Reads never fail loudly. A missing key or a record of another type logs a
warning and yields the caller's default; use [`SaveFile::try_get`] to see
the actual error.

```rust
use esave_core::{Dispatcher, SaveFile, SaveFileDescriptor, SaveRoots};

let dir = tempfile::tempdir()?;
let roots = SaveRoots::single(dir.path());
let descriptor = SaveFileDescriptor::new("Slot1").with_path("Saves");

let file = SaveFile::new(descriptor, roots, Dispatcher::new())?;
file.set("score", 42i32);
file.save(false);

file.clear();
file.load(false);
assert_eq!(file.get("score", 0i32), 42);
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use glam::{Quat, Vec2, Vec3, Vec4};
use tracing::{debug, info, warn};

use crate::config::{SaveFileDescriptor, SaveRoots};
use crate::encryption::CipherAdapter;
use crate::geometry::{
    quat_from_floats, vector2_from_floats, vector3_from_floats, vector4_from_floats, Color,
    SavableTransform, ToFloats, Transform,
};
use crate::operation::{
    lock, Action, CancellationToken, Dispatcher, Operation, OperationKind, OperationState,
};
use crate::savable::{Savable, SavableRecord};
use crate::storage::{LocalFileStorage, StorageAdapter};
use crate::{Result, SaveError};

type Records = BTreeMap<String, SavableRecord>;

/// Everything a worker needs to move the map to or from disk
#[derive(Clone)]
struct FileIo {
    path: PathBuf,
    data: Arc<Mutex<Records>>,
    storage: Arc<dyn StorageAdapter>,
    cipher: Arc<dyn CipherAdapter>,
}

impl FileIo {
    fn write(&self, token: &CancellationToken) -> Result<()> {
        let json = {
            let data = lock(&self.data);
            serde_json::to_vec_pretty(&*data)?
        };
        token.check()?;

        let bytes = self.cipher.encrypt(&json)?;
        token.check()?;

        self.storage.save(&bytes, &self.path)?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::SaveMetrics::global() {
            metrics.record_file_size(bytes.len());
        }

        info!(path = %self.path.display(), bytes = bytes.len(), "Saved file");
        Ok(())
    }

    fn read(&self, token: &CancellationToken) -> Result<()> {
        if !self.storage.exists(&self.path) {
            info!(path = %self.path.display(), "Save file not found, creating it");
            return self.write(token);
        }

        let bytes = self.storage.load(&self.path)?;
        token.check()?;

        let plain = self.cipher.decrypt(&bytes)?;
        token.check()?;

        let records = parse_records(&plain)?;
        let count = records.len();
        *lock(&self.data) = records;

        debug!(path = %self.path.display(), records = count, "Loaded file");
        Ok(())
    }
}

/// Parse decrypted file content; blank content and JSON `null` are an empty map
fn parse_records(bytes: &[u8]) -> Result<Records> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SaveError::invalid_format(format!("save file is not valid UTF-8: {e}")))?;

    if text.trim().is_empty() {
        return Ok(Records::new());
    }

    let parsed: Option<Records> = serde_json::from_str(text)?;
    Ok(parsed.unwrap_or_default())
}

/// An in-memory keyed store of typed records backed by one file
///
/// All methods take `&self`; the map sits behind a mutex so a background
/// save always serializes a consistent snapshot.
pub struct SaveFile {
    descriptor: SaveFileDescriptor,
    roots: SaveRoots,
    directory: PathBuf,
    full_path: PathBuf,
    data: Arc<Mutex<Records>>,
    storage: Arc<dyn StorageAdapter>,
    cipher: Arc<dyn CipherAdapter>,
    dispatcher: Dispatcher,
    save_operation: Mutex<Option<Operation>>,
    load_operation: Mutex<Option<Operation>>,
}

impl fmt::Debug for SaveFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveFile")
            .field("file_name", &self.descriptor.file_name)
            .field("full_path", &self.full_path)
            .field("cipher", &self.cipher.algorithm_name())
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl SaveFile {
    /// Create a save file on the local filesystem
    ///
    /// Validates the descriptor and resolves paths. No I/O happens until
    /// [`save`](SaveFile::save) or [`load`](SaveFile::load).
    pub fn new(
        descriptor: SaveFileDescriptor,
        roots: SaveRoots,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        Self::with_storage(descriptor, roots, dispatcher, Arc::new(LocalFileStorage::new()))
    }

    /// Create a save file on a custom storage adapter
    pub fn with_storage(
        descriptor: SaveFileDescriptor,
        roots: SaveRoots,
        dispatcher: Dispatcher,
        storage: Arc<dyn StorageAdapter>,
    ) -> Result<Self> {
        let cipher = descriptor.cipher()?;
        Self::with_adapters(descriptor, roots, dispatcher, storage, cipher)
    }

    /// Create a save file with custom storage and cipher adapters
    ///
    /// The cipher replaces whatever the descriptor's encryption settings
    /// would build, until [`set_descriptor`](SaveFile::set_descriptor).
    pub fn with_adapters(
        descriptor: SaveFileDescriptor,
        roots: SaveRoots,
        dispatcher: Dispatcher,
        storage: Arc<dyn StorageAdapter>,
        cipher: Arc<dyn CipherAdapter>,
    ) -> Result<Self> {
        descriptor.validate()?;

        Ok(Self {
            cipher,
            directory: descriptor.directory(&roots),
            full_path: descriptor.full_path(&roots),
            descriptor,
            roots,
            data: Arc::new(Mutex::new(Records::new())),
            storage,
            dispatcher,
            save_operation: Mutex::new(None),
            load_operation: Mutex::new(None),
        })
    }

    /// Create a save file and start loading it
    ///
    /// A file that does not exist yet is created empty. With a background
    /// descriptor the load may still be running when this returns.
    pub fn open(
        descriptor: SaveFileDescriptor,
        roots: SaveRoots,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let file = Self::new(descriptor, roots, dispatcher)?;
        file.load(true);
        Ok(file)
    }

    fn io(&self) -> FileIo {
        FileIo {
            path: self.full_path.clone(),
            data: Arc::clone(&self.data),
            storage: Arc::clone(&self.storage),
            cipher: Arc::clone(&self.cipher),
        }
    }

    fn operation_slot(&self, kind: OperationKind) -> &Mutex<Option<Operation>> {
        match kind {
            OperationKind::Save => &self.save_operation,
            OperationKind::Load => &self.load_operation,
        }
    }

    fn start_operation(&self, kind: OperationKind, ignore_existing: bool) -> Option<Operation> {
        let operation = {
            let mut slot = lock(self.operation_slot(kind));
            let active = slot.as_ref().is_some_and(|op| !op.state().is_terminal());
            if active && !ignore_existing {
                warn!(
                    file = %self.descriptor.file_name,
                    %kind,
                    "Operation already ongoing, request ignored"
                );
                return None;
            }

            let io = self.io();
            let action: Action = match kind {
                OperationKind::Save => Box::new(move |token: &CancellationToken| io.write(token)),
                OperationKind::Load => Box::new(move |token: &CancellationToken| io.read(token)),
            };

            let operation = Operation::new(
                kind,
                self.descriptor.background_task,
                self.dispatcher.clone(),
                action,
            );
            *slot = Some(operation.clone());
            operation
        };

        operation.start();
        Some(operation)
    }

    /// Write the whole map to disk
    ///
    /// Returns `None` without doing anything if a save is still in flight,
    /// unless `ignore_existing` is set.
    pub fn save(&self, ignore_existing: bool) -> Option<Operation> {
        self.start_operation(OperationKind::Save, ignore_existing)
    }

    /// Replace the map with the file's content, creating the file if absent
    ///
    /// Returns `None` without doing anything if a load is still in flight,
    /// unless `ignore_existing` is set. On failure the map is left untouched.
    pub fn load(&self, ignore_existing: bool) -> Option<Operation> {
        self.start_operation(OperationKind::Load, ignore_existing)
    }

    /// The most recent operation of a kind
    pub fn operation(&self, kind: OperationKind) -> Option<Operation> {
        lock(self.operation_slot(kind)).clone()
    }

    /// True while a save or a load is in flight
    pub fn is_operation_ongoing(&self) -> bool {
        [OperationKind::Save, OperationKind::Load]
            .into_iter()
            .filter_map(|kind| self.operation(kind))
            .any(|op| op.is_ongoing())
    }

    /// Block until background workers have finished
    pub fn wait_for_operations(&self) {
        for kind in [OperationKind::Save, OperationKind::Load] {
            if let Some(op) = self.operation(kind) {
                op.wait();
            }
        }
    }

    /// Insert or overwrite a value
    pub fn set<T: Savable>(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        match SavableRecord::new(&value) {
            Ok(record) => {
                lock(&self.data).insert(key, record);
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to serialize value, not stored"),
        }
    }

    /// The value stored under `key`, or `default` if it is missing or of another type
    pub fn get<T: Savable>(&self, key: &str, default: T) -> T {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(file = %self.descriptor.file_name, key, error = %e, "Returning default value");
                default
            }
        }
    }

    /// Like [`get`](SaveFile::get) with `T::default()` as the fallback
    pub fn get_or_default<T: Savable + Default>(&self, key: &str) -> T {
        self.get(key, T::default())
    }

    /// The value stored under `key`
    ///
    /// Fails with [`SaveError::KeyNotFound`] or [`SaveError::TypeMismatch`].
    pub fn try_get<T: Savable>(&self, key: &str) -> Result<T> {
        let data = lock(&self.data);
        let record = data
            .get(key)
            .ok_or_else(|| SaveError::KeyNotFound(key.to_string()))?;
        record.decode(key)
    }

    /// Values for several keys; missing and mismatched keys are skipped
    pub fn get_many<T, I>(&self, keys: I) -> Vec<T>
    where
        T: Savable,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let data = lock(&self.data);
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                let Some(record) = data.get(key) else {
                    warn!(file = %self.descriptor.file_name, key, "Key not found");
                    return None;
                };
                record
                    .decode(key)
                    .map_err(|e| debug!(key, error = %e, "Skipping record"))
                    .ok()
            })
            .collect()
    }

    /// Key and value of every record of type `T`
    pub fn entries_of_type<T: Savable>(&self) -> Vec<(String, T)> {
        let data = lock(&self.data);
        data.iter()
            .filter(|(_, record)| record.is::<T>())
            .filter_map(|(key, record)| match record.decode(key) {
                Ok(value) => Some((key.clone(), value)),
                Err(e) => {
                    debug!(key = %key, error = %e, "Skipping undecodable record");
                    None
                }
            })
            .collect()
    }

    /// Every value of type `T`, in key order
    pub fn all_of_type<T: Savable>(&self) -> Vec<T> {
        self.entries_of_type()
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// The first value of type `T` in key order
    pub fn first_of_type<T: Savable>(&self) -> Option<T> {
        let data = lock(&self.data);
        data.iter()
            .filter(|(_, record)| record.is::<T>())
            .find_map(|(key, record)| record.decode(key).ok())
    }

    /// Remove a record; returns false (with a warning) if there was none
    pub fn delete(&self, key: &str) -> bool {
        if lock(&self.data).remove(key).is_some() {
            true
        } else {
            warn!(file = %self.descriptor.file_name, key, "Key not found, nothing deleted");
            false
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        lock(&self.data).contains_key(key)
    }

    /// Remove every record from memory; the file is untouched
    pub fn clear(&self) {
        lock(&self.data).clear();
    }

    /// Remove every record and overwrite the file with the empty map
    pub fn empty_file(&self) -> Option<Operation> {
        self.clear();
        self.save(true)
    }

    /// Delete the backing file and drop all records
    ///
    /// Outstanding operations are canceled and awaited first.
    pub fn delete_file(&self) -> Result<()> {
        for kind in [OperationKind::Save, OperationKind::Load] {
            if let Some(op) = self.operation(kind) {
                op.cancel();
                op.wait();
            }
        }

        self.storage.delete(&self.full_path)?;
        self.clear();
        info!(path = %self.full_path.display(), "Deleted save file");
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.data).is_empty()
    }

    pub fn has_any_data(&self) -> bool {
        !self.is_empty()
    }

    /// All keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        lock(&self.data).keys().cloned().collect()
    }

    /// The raw tagged record under `key`
    pub fn record(&self, key: &str) -> Option<SavableRecord> {
        lock(&self.data).get(key).cloned()
    }

    /// Store a raw tagged record
    pub fn set_record(&self, key: impl Into<String>, record: SavableRecord) {
        lock(&self.data).insert(key.into(), record);
    }

    /// A copy of every record
    pub fn snapshot(&self) -> BTreeMap<String, SavableRecord> {
        lock(&self.data).clone()
    }

    pub fn set_vector2(&self, key: impl Into<String>, value: Vec2) {
        self.set(key, value.to_float2());
    }

    pub fn set_vector3(&self, key: impl Into<String>, value: Vec3) {
        self.set(key, value.to_float3());
    }

    pub fn set_vector4(&self, key: impl Into<String>, value: Vec4) {
        self.set(key, value.to_float4());
    }

    pub fn set_quaternion(&self, key: impl Into<String>, value: Quat) {
        self.set(key, value.to_float4());
    }

    pub fn set_color(&self, key: impl Into<String>, value: Color) {
        self.set(key, value.to_float4());
    }

    pub fn set_transform(&self, key: impl Into<String>, value: &Transform) {
        self.set(key, SavableTransform::from_transform(value));
    }

    fn get_floats(&self, key: &str) -> Option<Vec<f32>> {
        let values: Vec<f32> = self.get(key, Vec::new());
        (!values.is_empty()).then_some(values)
    }

    pub fn get_vector2(&self, key: &str, default: Vec2) -> Vec2 {
        self.get_floats(key)
            .map_or(default, |v| vector2_from_floats(&v))
    }

    pub fn get_vector3(&self, key: &str, default: Vec3) -> Vec3 {
        self.get_floats(key)
            .map_or(default, |v| vector3_from_floats(&v))
    }

    pub fn get_vector4(&self, key: &str, default: Vec4) -> Vec4 {
        self.get_floats(key)
            .map_or(default, |v| vector4_from_floats(&v))
    }

    pub fn get_quaternion(&self, key: &str, default: Quat) -> Quat {
        self.get_floats(key).map_or(default, |v| quat_from_floats(&v))
    }

    pub fn get_color(&self, key: &str, default: Color) -> Color {
        self.get_floats(key)
            .map_or(default, |v| Color::from_floats(&v))
    }

    pub fn get_transform(&self, key: &str, default: Transform) -> Transform {
        match self.try_get::<SavableTransform>(key) {
            Ok(saved) => saved.to_transform(),
            Err(e) => {
                warn!(file = %self.descriptor.file_name, key, error = %e, "Returning default transform");
                default
            }
        }
    }

    pub fn descriptor(&self) -> &SaveFileDescriptor {
        &self.descriptor
    }

    /// Point this save file at a new location or encryption and reload it
    ///
    /// Outstanding operations are awaited first. Records in memory are
    /// replaced by the content at the new location (or written there if
    /// nothing exists yet).
    pub fn set_descriptor(&mut self, descriptor: SaveFileDescriptor) -> Result<Option<Operation>> {
        descriptor.validate()?;
        let cipher = descriptor.cipher()?;
        self.wait_for_operations();

        self.directory = descriptor.directory(&self.roots);
        self.full_path = descriptor.full_path(&self.roots);
        self.cipher = cipher;
        self.descriptor = descriptor;

        Ok(self.load(true))
    }

    pub fn file_name(&self) -> &str {
        &self.descriptor.file_name
    }

    /// Directory holding the file
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Full path of the file, extension included
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn file_extension(&self) -> &'static str {
        self.descriptor.file_type.extension()
    }

    pub fn file_exists(&self) -> bool {
        self.storage.exists(&self.full_path)
    }

    /// Terminal state of the most recent operation of a kind, if it ended
    pub fn last_state(&self, kind: OperationKind) -> Option<OperationState> {
        self.operation(kind)
            .map(|op| op.state())
            .filter(|state| state.is_terminal())
    }
}
