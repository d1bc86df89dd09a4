//! Configuration for save file locations, formats and encryption
//!
//! A [`SaveFileDescriptor`] says where a save file lives relative to one of
//! two host-provided roots, how it is encoded and whether it is encrypted.
//! [`SaveRoots`] supplies the two roots themselves. Descriptors are plain
//! serde structs so the registry can persist them in its manifest.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::encryption::{
    encode_token, generate_iv, generate_key, AesCipher, CipherAdapter, KeyEncoding, KeySize,
    NoEncryption,
};
use crate::{Result, SaveError};

/// Which root directory a save file lives under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SaveLocation {
    /// User-writable per-application data directory
    #[default]
    PersistentData,
    /// Directory bundled with the application
    Data,
}

/// Supported on-disk encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    Json,
}

impl FileType {
    /// File extension, used regardless of encryption
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Json => "json",
        }
    }
}

/// Supported encryption methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[default]
    None,
    Aes,
}

/// Everything needed to locate, encode and encrypt one save file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveFileDescriptor {
    /// File name without extension; also the key in the registry
    pub file_name: String,
    /// Root the file is stored under
    pub save_location: SaveLocation,
    /// Sub-path below the root; may be empty
    pub file_path: String,
    pub file_type: FileType,
    pub encryption_method: EncryptionMethod,
    /// AES key as text, decoded per `aes_key_encoding`
    pub aes_key: Option<String>,
    /// AES IV as text, decoded per `aes_key_encoding`
    pub aes_iv: Option<String>,
    /// `Auto` for manifests written before the encoding was recorded
    pub aes_key_encoding: KeyEncoding,
    /// Record this file in the registry manifest so it is rehydrated on next start
    pub add_to_registry: bool,
    /// Run saves and loads on a background worker
    pub background_task: bool,
}

impl Default for SaveFileDescriptor {
    fn default() -> Self {
        Self {
            file_name: "SaveFileName".to_string(),
            save_location: SaveLocation::PersistentData,
            file_path: "Example/Path".to_string(),
            file_type: FileType::Json,
            encryption_method: EncryptionMethod::None,
            aes_key: None,
            aes_iv: None,
            aes_key_encoding: KeyEncoding::Auto,
            add_to_registry: true,
            background_task: false,
        }
    }
}

impl SaveFileDescriptor {
    /// Create an unencrypted, synchronous JSON descriptor at the root of persistent data
    pub fn new<S: Into<String>>(file_name: S) -> Self {
        Self {
            file_name: file_name.into(),
            file_path: String::new(),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, location: SaveLocation) -> Self {
        self.save_location = location;
        self
    }

    /// Set the sub-path below the root (e.g. `"Saves"` or `"Profiles/Alice"`)
    pub fn with_path<S: Into<String>>(mut self, file_path: S) -> Self {
        self.file_path = file_path.into();
        self
    }

    /// Enable AES with a base64 key and IV, as produced by [`encode_token`]
    pub fn with_aes<K: Into<String>, I: Into<String>>(mut self, key: K, iv: I) -> Self {
        self.encryption_method = EncryptionMethod::Aes;
        self.aes_key = Some(key.into());
        self.aes_iv = Some(iv.into());
        self.aes_key_encoding = KeyEncoding::Base64;
        self
    }

    /// Enable AES with a legacy passphrase key and IV used as ASCII bytes
    pub fn with_ascii_aes<K: Into<String>, I: Into<String>>(self, key: K, iv: I) -> Self {
        self.with_aes(key, iv).with_key_encoding(KeyEncoding::Ascii)
    }

    pub fn with_key_encoding(mut self, encoding: KeyEncoding) -> Self {
        self.aes_key_encoding = encoding;
        self
    }

    /// Enable AES with freshly generated key material
    pub fn with_generated_aes_tokens(mut self, size: KeySize) -> Self {
        self.encryption_method = EncryptionMethod::Aes;
        self.generate_aes_tokens(size);
        self
    }

    /// Run I/O on a background worker
    pub fn in_background(mut self, background: bool) -> Self {
        self.background_task = background;
        self
    }

    /// Keep this file out of the registry manifest
    pub fn without_registry(mut self) -> Self {
        self.add_to_registry = false;
        self
    }

    /// Replace the AES key and IV with random material
    pub fn generate_aes_tokens(&mut self, size: KeySize) {
        self.aes_key = Some(encode_token(&generate_key(size)));
        self.aes_iv = Some(encode_token(&generate_iv()));
        self.aes_key_encoding = KeyEncoding::Base64;
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_method == EncryptionMethod::Aes
    }

    /// Directory holding the file: `{root}/{file_path}`
    pub fn directory(&self, roots: &SaveRoots) -> PathBuf {
        let root = roots.resolve(self.save_location);
        if self.file_path.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.file_path)
        }
    }

    /// Full path: `{root}/{file_path}/{file_name}.{extension}`
    pub fn full_path(&self, roots: &SaveRoots) -> PathBuf {
        self.directory(roots).join(format!(
            "{}.{}",
            self.file_name,
            self.file_type.extension()
        ))
    }

    /// Build the cipher adapter this descriptor asks for
    pub fn cipher(&self) -> Result<Arc<dyn CipherAdapter>> {
        match self.encryption_method {
            EncryptionMethod::None => Ok(Arc::new(NoEncryption::new())),
            EncryptionMethod::Aes => {
                let (key, iv) = match (&self.aes_key, &self.aes_iv) {
                    (Some(key), Some(iv)) => (key, iv),
                    _ => {
                        return Err(SaveError::validation(
                            "AES encryption requires both a key and an IV",
                        ))
                    }
                };
                Ok(Arc::new(AesCipher::from_tokens(
                    key,
                    iv,
                    self.aes_key_encoding,
                )?))
            }
        }
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        let name = self.file_name.trim();
        if name.is_empty() {
            return Err(SaveError::validation("file_name cannot be empty"));
        }
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(SaveError::validation(format!(
                "file_name '{}' must not contain path separators",
                self.file_name
            )));
        }

        let sub_path = Path::new(&self.file_path);
        if sub_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SaveError::validation(format!(
                "file_path '{}' must be a relative path without '..'",
                self.file_path
            )));
        }

        if self.is_encrypted() {
            self.cipher()?;
        }
        Ok(())
    }
}

crate::impl_savable!(SaveFileDescriptor => "SaveFileDescriptor");

/// The two host-provided root directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRoots {
    /// Application-bundled directory
    pub data_path: PathBuf,
    /// User-writable directory
    pub persistent_data_path: PathBuf,
}

impl SaveRoots {
    pub fn new<D: Into<PathBuf>, P: Into<PathBuf>>(data_path: D, persistent_data_path: P) -> Self {
        Self {
            data_path: data_path.into(),
            persistent_data_path: persistent_data_path.into(),
        }
    }

    /// Use one directory for both roots
    pub fn single<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        Self {
            data_path: dir.clone(),
            persistent_data_path: dir,
        }
    }

    /// Standard roots for an application
    ///
    /// Persistent data goes to the platform data directory (for example
    /// `~/.local/share/{app_name}` on Linux); bundled data is the directory
    /// containing the running executable.
    pub fn for_application(app_name: &str) -> Result<Self> {
        let persistent = dirs::data_dir()
            .ok_or_else(|| SaveError::validation("No user data directory on this platform"))?
            .join(app_name);

        let exe = std::env::current_exe()?;
        let data = exe
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| SaveError::validation("Executable has no parent directory"))?;

        Ok(Self::new(data, persistent))
    }

    /// Root directory for a location
    pub fn resolve(&self, location: SaveLocation) -> &Path {
        match location {
            SaveLocation::PersistentData => &self.persistent_data_path,
            SaveLocation::Data => &self.data_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> SaveRoots {
        SaveRoots::new("/app/data", "/home/user/.local/share/game")
    }

    #[test]
    fn test_default_descriptor() {
        let descriptor = SaveFileDescriptor::default();
        assert_eq!(descriptor.file_name, "SaveFileName");
        assert_eq!(descriptor.file_path, "Example/Path");
        assert_eq!(descriptor.save_location, SaveLocation::PersistentData);
        assert_eq!(descriptor.encryption_method, EncryptionMethod::None);
        assert!(descriptor.add_to_registry);
        assert!(!descriptor.background_task);
    }

    #[test]
    fn test_full_path_construction() {
        let descriptor = SaveFileDescriptor::new("Slot1").with_path("Saves");
        assert_eq!(
            descriptor.full_path(&roots()),
            PathBuf::from("/home/user/.local/share/game/Saves/Slot1.json")
        );

        let descriptor = SaveFileDescriptor::new("Config").with_location(SaveLocation::Data);
        assert_eq!(
            descriptor.full_path(&roots()),
            PathBuf::from("/app/data/Config.json")
        );
    }

    #[test]
    fn test_encrypted_file_keeps_json_extension() {
        let descriptor =
            SaveFileDescriptor::new("Secret").with_generated_aes_tokens(KeySize::Aes128);
        assert!(descriptor.full_path(&roots()).ends_with("Secret.json"));
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.cipher().unwrap().algorithm_name(), "aes-128-cbc");
    }

    #[test]
    fn test_validate_file_name() {
        assert!(SaveFileDescriptor::new("").validate().is_err());
        assert!(SaveFileDescriptor::new("a/b").validate().is_err());
        assert!(SaveFileDescriptor::new("..").validate().is_err());
        assert!(SaveFileDescriptor::new("Slot1").validate().is_ok());
    }

    #[test]
    fn test_validate_sub_path() {
        let base = SaveFileDescriptor::new("Slot1");
        assert!(base.clone().with_path("Saves/Profiles").validate().is_ok());
        assert!(base.clone().with_path("../escape").validate().is_err());
        assert!(base.with_path("/etc").validate().is_err());
    }

    #[test]
    fn test_validate_aes_requires_material() {
        let mut descriptor = SaveFileDescriptor::new("Slot1");
        descriptor.encryption_method = EncryptionMethod::Aes;
        assert!(descriptor.validate().is_err());

        descriptor.aes_key = Some("short".to_string());
        descriptor.aes_iv = Some("0123456789abcdef".to_string());
        assert!(descriptor.validate().is_err());

        descriptor.aes_key = Some("0123456789abcdef".to_string());
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_descriptor_serialization_roundtrip() {
        let descriptor = SaveFileDescriptor::new("Slot2")
            .with_path("Saves")
            .with_generated_aes_tokens(KeySize::Aes256)
            .in_background(true);

        let json = serde_json::to_string(&descriptor).unwrap();
        let parsed: SaveFileDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn test_descriptor_tolerates_missing_fields() {
        let parsed: SaveFileDescriptor =
            serde_json::from_str(r#"{"file_name": "Old", "file_path": ""}"#).unwrap();
        assert_eq!(parsed.file_name, "Old");
        assert_eq!(parsed.encryption_method, EncryptionMethod::None);
        assert_eq!(parsed.aes_key_encoding, KeyEncoding::Auto);
        assert!(parsed.add_to_registry);
    }

    #[test]
    fn test_key_encoding_follows_builder() {
        let generated = SaveFileDescriptor::new("A").with_generated_aes_tokens(KeySize::Aes256);
        assert_eq!(generated.aes_key_encoding, KeyEncoding::Base64);

        let legacy = SaveFileDescriptor::new("B")
            .with_ascii_aes("abcdefghijklmnopqrstuvwxyz012345", "abcdef9876543210");
        assert_eq!(legacy.aes_key_encoding, KeyEncoding::Ascii);
        assert_eq!(legacy.cipher().unwrap().algorithm_name(), "aes-256-cbc");

        // The same text read as base64 is a 24-byte key
        let guessed = legacy.with_key_encoding(KeyEncoding::Auto);
        assert_eq!(guessed.cipher().unwrap().algorithm_name(), "aes-192-cbc");
    }

    #[test]
    fn test_single_root() {
        let roots = SaveRoots::single("/tmp/saves");
        assert_eq!(roots.resolve(SaveLocation::Data), Path::new("/tmp/saves"));
        assert_eq!(
            roots.resolve(SaveLocation::PersistentData),
            Path::new("/tmp/saves")
        );
    }
}
