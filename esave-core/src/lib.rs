/*!
# ESave Core

Save-game persistence: typed key-value save files written to disk as JSON,
optionally AES encrypted.

- [`SaveFile`] holds a map of tagged records in memory and mirrors it to a
  single file with atomic writes
- [`Operation`] runs saves and loads inline or on a background worker, with
  cooperative cancellation and one-shot completion listeners delivered
  through a [`Dispatcher`]
- [`SaveRegistry`] tracks open save files and keeps a manifest so they can
  be reopened on the next start
- [`geometry`] converts vectors, rotations, colors and transforms to the
  float arrays they are stored as

## Architecture

Storage and encryption are adapters behind the [`StorageAdapter`] and
[`CipherAdapter`] traits. The save file decides what bytes to write; the
adapters decide how they are encrypted and where they go.

## Usage

```rust
use esave_core::{Dispatcher, SaveRegistry, SaveFileDescriptor, SaveRoots};

let dir = tempfile::tempdir()?;
let dispatcher = Dispatcher::new();
let mut registry = SaveRegistry::open(SaveRoots::single(dir.path()), dispatcher.clone())?;

let slot = registry.create_save(SaveFileDescriptor::new("Slot1").with_path("Saves"))?;
slot.set("score", 42i32);
slot.save(false);

// Run completion callbacks of background operations on this thread
dispatcher.pump();

registry.close()?;
# Ok::<(), esave_core::SaveError>(())
```
*/

pub mod config;
pub mod container;
pub mod encryption;
pub mod error;
pub mod geometry;
pub mod observability;
pub mod operation;
pub mod registry;
pub mod savable;
pub mod storage;

#[cfg(test)]
mod error_tests;

pub use config::{EncryptionMethod, FileType, SaveFileDescriptor, SaveLocation, SaveRoots};
pub use container::SaveFile;
pub use encryption::{AesCipher, CipherAdapter, KeyEncoding, KeySize, NoEncryption};
pub use error::{Result, SaveError};
pub use geometry::{Color, SavableTransform, SavableVector, ToFloats, Transform};
pub use operation::{CancellationToken, Dispatcher, Operation, OperationKind, OperationState};
pub use registry::SaveRegistry;
pub use savable::{Savable, SavableRecord};
pub use storage::{LocalFileStorage, StorageAdapter};
