/*!
ESave CLI - Command-line interface for ESave save files.

Inspect, edit and decrypt save files and list the saves recorded in the
registry manifest.
*/

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use esave_core::encryption::{encode_token, generate_iv, generate_key};
use esave_core::registry::default_manifest_descriptor;
use esave_core::{
    AesCipher, CipherAdapter, Dispatcher, KeyEncoding, KeySize, LocalFileStorage, Operation,
    OperationState, SavableRecord, SaveFile, SaveFileDescriptor, SaveLocation, SaveRoots,
    StorageAdapter,
};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tabled::{Table, Tabled};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "esave")]
#[command(about = "CLI for ESave save files")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory used for both save roots (defaults to the platform data directory)
    #[arg(short, long, global = true, env = "ESAVE_ROOT")]
    root: Option<PathBuf>,

    /// Which root the save file lives under
    #[arg(short, long, global = true, value_enum, default_value = "persistent")]
    location: Location,

    /// Sub-path below the root
    #[arg(short, long, global = true, default_value = "")]
    path: String,

    /// AES key for encrypted save files
    #[arg(long, global = true, env = "ESAVE_AES_KEY", hide_env_values = true)]
    aes_key: Option<String>,

    /// AES IV for encrypted save files
    #[arg(long, global = true, env = "ESAVE_AES_IV", hide_env_values = true)]
    aes_iv: Option<String>,

    /// How the AES key and IV text is turned into bytes
    #[arg(long, global = true, value_enum, default_value = "auto")]
    key_encoding: KeyText,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Location {
    Persistent,
    Data,
}

impl From<Location> for SaveLocation {
    fn from(location: Location) -> Self {
        match location {
            Location::Persistent => SaveLocation::PersistentData,
            Location::Data => SaveLocation::Data,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KeyText {
    /// Base64 when it decodes to an AES length, ASCII otherwise
    Auto,
    Base64,
    /// Legacy passphrase, used as its ASCII bytes
    Ascii,
}

impl From<KeyText> for KeyEncoding {
    fn from(text: KeyText) -> Self {
        match text {
            KeyText::Auto => KeyEncoding::Auto,
            KeyText::Base64 => KeyEncoding::Base64,
            KeyText::Ascii => KeyEncoding::Ascii,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random AES key and IV
    Keygen {
        /// Key size in bits (128, 192 or 256)
        #[arg(short, long, default_value_t = 256)]
        bits: u32,
    },
    /// List the save files recorded in the registry manifest
    List,
    /// Show every record of a save file
    Show {
        /// Save file name without extension
        file: String,
    },
    /// Print one record's value as JSON
    Get {
        /// Save file name without extension
        file: String,
        /// Record key
        key: String,
    },
    /// Store a JSON value under a key and save the file
    Set {
        /// Save file name without extension
        file: String,
        /// Record key
        key: String,
        /// Value as JSON text
        value: String,
        /// Type tag to store (inferred from the value or existing record if omitted)
        #[arg(short = 't', long = "type")]
        type_name: Option<String>,
    },
    /// Delete a record and save the file
    Delete {
        /// Save file name without extension
        file: String,
        /// Record key
        key: String,
    },
    /// Print the decrypted content of an encrypted save file
    Decrypt {
        /// Save file name without extension
        file: String,
    },
}

#[derive(Tabled)]
struct SaveInfo {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Encryption")]
    encryption: String,
    #[tabled(rename = "Records")]
    records: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
}

#[derive(Tabled)]
struct RecordInfo {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let roots = resolve_roots(&cli)?;
    debug!(?roots, "Resolved save roots");

    match &cli.command {
        Commands::Keygen { bits } => keygen(*bits)?,
        Commands::List => list_saves(&roots)?,
        Commands::Show { file } => show_file(&open_existing(&cli, &roots, file)?)?,
        Commands::Get { file, key } => get_record(&open_existing(&cli, &roots, file)?, key)?,
        Commands::Set {
            file,
            key,
            value,
            type_name,
        } => set_record(&open_or_create(&cli, &roots, file)?, key, value, type_name.as_deref())?,
        Commands::Delete { file, key } => {
            delete_record(&open_existing(&cli, &roots, file)?, key)?
        }
        Commands::Decrypt { file } => decrypt_file(&cli, &roots, file)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_roots(cli: &Cli) -> Result<SaveRoots, anyhow::Error> {
    match &cli.root {
        Some(root) => Ok(SaveRoots::single(root)),
        None => SaveRoots::for_application("ESave").context("Failed to resolve save roots"),
    }
}

fn descriptor_for(cli: &Cli, file: &str) -> SaveFileDescriptor {
    let descriptor = SaveFileDescriptor::new(file)
        .with_location(cli.location.into())
        .with_path(cli.path.clone())
        .without_registry();

    match (&cli.aes_key, &cli.aes_iv) {
        (Some(key), Some(iv)) => descriptor
            .with_aes(key.clone(), iv.clone())
            .with_key_encoding(cli.key_encoding.into()),
        _ => descriptor,
    }
}

/// Open a save file that must already exist and load it
fn open_existing(cli: &Cli, roots: &SaveRoots, file: &str) -> Result<SaveFile, anyhow::Error> {
    let save = SaveFile::new(descriptor_for(cli, file), roots.clone(), Dispatcher::new())?;
    if !save.file_exists() {
        bail!("Save file not found: {}", save.full_path().display());
    }

    finish(save.load(false), "load")?;
    Ok(save)
}

/// Open a save file, creating it if it does not exist yet
fn open_or_create(cli: &Cli, roots: &SaveRoots, file: &str) -> Result<SaveFile, anyhow::Error> {
    let save = SaveFile::new(descriptor_for(cli, file), roots.clone(), Dispatcher::new())?;
    finish(save.load(false), "load")?;
    Ok(save)
}

/// Turn a synchronous operation outcome into a CLI error
fn finish(operation: Option<Operation>, what: &str) -> Result<(), anyhow::Error> {
    let operation = operation.ok_or_else(|| anyhow!("Another {what} is already running"))?;
    match operation.state() {
        OperationState::Completed => Ok(()),
        state => Err(anyhow!(
            "{what} ended as {state:?}: {}",
            operation.error().unwrap_or_default()
        )),
    }
}

fn keygen(bits: u32) -> Result<(), anyhow::Error> {
    let size = KeySize::from_bits(bits)
        .ok_or_else(|| anyhow!("Unsupported key size {bits}, expected 128, 192 or 256"))?;

    println!("key: {}", encode_token(&generate_key(size)));
    println!("iv:  {}", encode_token(&generate_iv()));
    Ok(())
}

fn list_saves(roots: &SaveRoots) -> Result<(), anyhow::Error> {
    let manifest_path = default_manifest_descriptor().full_path(roots);
    if !manifest_path.is_file() {
        println!("No registry manifest found at: {}", manifest_path.display());
        return Ok(());
    }

    info!("Listing saves from {}", manifest_path.display());
    // Listing reads the manifest as a plain save file and never writes it
    let manifest = SaveFile::new(
        default_manifest_descriptor(),
        roots.clone(),
        Dispatcher::new(),
    )?;
    finish(manifest.load(false), "load")?;

    let saves: Vec<SaveInfo> = manifest
        .entries_of_type::<SaveFileDescriptor>()
        .into_iter()
        .map(|(name, descriptor)| save_info(name, descriptor, roots))
        .collect();

    if saves.is_empty() {
        println!("No saves registered");
    } else {
        println!("{}", Table::new(saves));
    }
    Ok(())
}

/// Table row for one manifest entry; files that are missing or unreadable show `-` records
fn save_info(name: String, descriptor: SaveFileDescriptor, roots: &SaveRoots) -> SaveInfo {
    let path = descriptor.full_path(roots);
    let encryption = if descriptor.is_encrypted() { "aes" } else { "none" };

    let records = SaveFile::new(descriptor, roots.clone(), Dispatcher::new())
        .ok()
        .filter(SaveFile::file_exists)
        .and_then(|file| {
            let op = file.load(false)?;
            (op.state() == OperationState::Completed).then_some(file.len())
        });
    let (size, modified) = file_stats(&path);

    SaveInfo {
        name,
        path: path.display().to_string(),
        encryption: encryption.to_string(),
        records: records.map_or_else(|| "-".to_string(), |count| count.to_string()),
        size,
        modified,
    }
}

fn show_file(save: &SaveFile) -> Result<(), anyhow::Error> {
    println!("Save File Details:");
    println!("  Name: {}", save.file_name());
    println!("  Path: {}", save.full_path().display());
    println!(
        "  Encryption: {}",
        if save.descriptor().is_encrypted() {
            "aes"
        } else {
            "none"
        }
    );
    let (size, modified) = file_stats(save.full_path());
    println!("  Size: {size}");
    println!("  Modified: {modified}");

    let records: Vec<RecordInfo> = save
        .snapshot()
        .into_iter()
        .map(|(key, record)| RecordInfo {
            key,
            type_name: record.type_name().to_string(),
            value: record.value().to_string(),
        })
        .collect();

    if records.is_empty() {
        println!("No records");
    } else {
        println!("{}", Table::new(records));
    }
    Ok(())
}

fn get_record(save: &SaveFile, key: &str) -> Result<(), anyhow::Error> {
    let record = save
        .record(key)
        .ok_or_else(|| anyhow!("Key not found: {key}"))?;

    eprintln!("type: {}", record.type_name());
    println!("{}", serde_json::to_string_pretty(record.value())?);
    Ok(())
}

/// Type tag for a JSON value when the caller gave none
///
/// Numbers get the narrowest of `i32`, `i64`, `u64`, `f32`, `f64` that holds them.
fn infer_type_name(value: &serde_json::Value) -> Option<&'static str> {
    match value {
        serde_json::Value::Bool(_) => Some("bool"),
        serde_json::Value::Number(n) => Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(v), _, _) if i32::try_from(v).is_ok() => "i32",
            (Some(_), _, _) => "i64",
            (None, Some(_), _) => "u64",
            (_, _, Some(v)) if v.abs() <= f64::from(f32::MAX) => "f32",
            _ => "f64",
        }),
        serde_json::Value::String(_) => Some("String"),
        _ => None,
    }
}

fn set_record(
    save: &SaveFile,
    key: &str,
    value: &str,
    type_name: Option<&str>,
) -> Result<(), anyhow::Error> {
    let value: serde_json::Value =
        serde_json::from_str(value).with_context(|| format!("Value is not valid JSON: {value}"))?;

    let type_name = match type_name {
        Some(name) => name.to_string(),
        None => match save.record(key) {
            Some(existing) => existing.type_name().to_string(),
            None => infer_type_name(&value)
                .ok_or_else(|| anyhow!("Cannot infer a type for {value}, pass --type"))?
                .to_string(),
        },
    };

    save.set_record(key, SavableRecord::from_raw(type_name.clone(), value));
    finish(save.save(false), "save")?;

    println!("✓ Stored '{key}' as {type_name}");
    Ok(())
}

fn delete_record(save: &SaveFile, key: &str) -> Result<(), anyhow::Error> {
    if !save.delete(key) {
        bail!("Key not found: {key}");
    }

    finish(save.save(false), "save")?;
    println!("✓ Deleted '{key}'");
    Ok(())
}

fn decrypt_file(cli: &Cli, roots: &SaveRoots, file: &str) -> Result<(), anyhow::Error> {
    let (key, iv) = match (&cli.aes_key, &cli.aes_iv) {
        (Some(key), Some(iv)) => (key, iv),
        _ => bail!("Decrypting requires --aes-key and --aes-iv"),
    };

    let path = descriptor_for(cli, file).full_path(roots);
    let data = LocalFileStorage::new().load(&path)?;
    let plain = AesCipher::from_tokens(key, iv, cli.key_encoding.into())?.decrypt(&data)?;

    let json: serde_json::Value = serde_json::from_slice(&plain)
        .context("Decrypted content is not JSON; the key or IV is probably wrong")?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn file_stats(path: &Path) -> (String, String) {
    match std::fs::metadata(path) {
        Ok(meta) => (
            format_size(meta.len()),
            meta.modified()
                .map(format_timestamp)
                .unwrap_or_else(|_| "Unknown".to_string()),
        ),
        Err(_) => ("Unknown".to_string(), "Unknown".to_string()),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(time: SystemTime) -> String {
    let local: chrono::DateTime<chrono::Local> = time.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_infer_type_name() {
        assert_eq!(infer_type_name(&serde_json::json!(true)), Some("bool"));
        assert_eq!(infer_type_name(&serde_json::json!(42)), Some("i32"));
        assert_eq!(infer_type_name(&serde_json::json!(-7)), Some("i32"));
        assert_eq!(infer_type_name(&serde_json::json!(5_000_000_000i64)), Some("i64"));
        assert_eq!(infer_type_name(&serde_json::json!(u64::MAX)), Some("u64"));
        assert_eq!(infer_type_name(&serde_json::json!(0.5)), Some("f32"));
        assert_eq!(infer_type_name(&serde_json::json!(1e300)), Some("f64"));
        assert_eq!(infer_type_name(&serde_json::json!("x")), Some("String"));
        assert_eq!(infer_type_name(&serde_json::json!([1, 2])), None);
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "esave", "get", "Slot1", "score", "--root", "/tmp/saves", "--path", "Saves",
        ])
        .unwrap();

        assert_eq!(cli.root, Some(PathBuf::from("/tmp/saves")));
        assert_eq!(cli.path, "Saves");
        let descriptor = descriptor_for(&cli, "Slot1");
        assert_eq!(
            descriptor.full_path(&resolve_roots(&cli).unwrap()),
            PathBuf::from("/tmp/saves/Saves/Slot1.json")
        );
        assert!(!descriptor.is_encrypted());
    }

    #[test]
    fn test_inferred_big_integer_reads_back() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let save = SaveFile::new(
            SaveFileDescriptor::new("Big"),
            SaveRoots::single(temp_dir.path()),
            Dispatcher::new(),
        )
        .unwrap();

        set_record(&save, "big", "5000000000", None).unwrap();
        assert_eq!(save.get("big", 0i64), 5_000_000_000);
    }

    #[test]
    fn test_ascii_key_encoding_flag() {
        let cli = Cli::try_parse_from([
            "esave",
            "show",
            "Legacy",
            "--aes-key",
            "abcdefghijklmnopqrstuvwxyz012345",
            "--aes-iv",
            "abcdef9876543210",
            "--key-encoding",
            "ascii",
        ])
        .unwrap();

        let cipher = descriptor_for(&cli, "Legacy").cipher().unwrap();
        assert_eq!(cipher.algorithm_name(), "aes-256-cbc");
    }

    #[test]
    fn test_list_leaves_manifest_untouched() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let roots = SaveRoots::single(temp_dir.path());
        {
            let mut registry =
                esave_core::SaveRegistry::open(roots.clone(), Dispatcher::new()).unwrap();
            registry.create_save(SaveFileDescriptor::new("Kept")).unwrap();
            registry.create_save(SaveFileDescriptor::new("Gone")).unwrap();
            registry.close().unwrap();
        }
        std::fs::remove_file(temp_dir.path().join("Gone.json")).unwrap();

        let manifest_path = default_manifest_descriptor().full_path(&roots);
        let before = std::fs::read(&manifest_path).unwrap();
        list_saves(&roots).unwrap();

        assert_eq!(std::fs::read(&manifest_path).unwrap(), before);
        assert!(!temp_dir.path().join("Gone.json").exists());
    }
}
