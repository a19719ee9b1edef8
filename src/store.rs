use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde_json::Value;
use tempfile::Builder;

use crate::error::BtcError;

/// String-keyed persistent storage of JSON entries.
///
/// Implementations must be safe to share between the foreground and the
/// background fetcher; writes to a single key are last-write-wins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, BtcError>;
    fn set(&self, key: &str, entry: &Value) -> Result<(), BtcError>;
    fn keys(&self) -> Result<Vec<String>, BtcError>;
    fn delete(&self, key: &str) -> Result<(), BtcError>;

    fn contains(&self, key: &str) -> Result<bool, BtcError> {
        Ok(self.get(key)?.is_some())
    }
}

/// Root directories for the three key spaces the engine persists.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: Utf8PathBuf,
}

impl StoreLayout {
    pub fn new() -> Result<Self, BtcError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("btc-sync")).ok()
            })
            .ok_or_else(|| BtcError::Filesystem("unable to resolve cache directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn catalog_dir(&self) -> Utf8PathBuf {
        self.root.join("catalog")
    }

    pub fn content_dir(&self) -> Utf8PathBuf {
        self.root.join("content")
    }

    pub fn workspace_dir(&self) -> Utf8PathBuf {
        self.root.join("workspace")
    }
}

/// One pretty-printed JSON file per key. Keys are percent-escaped into file
/// names so that every key round-trips.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: Utf8PathBuf,
}

impl FsStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), BtcError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(|err| BtcError::Store(err.to_string()))
    }

    pub fn entry_path(&self, key: &str) -> Utf8PathBuf {
        self.root.join(format!("{}.json", escape_key(key)))
    }
}

impl KeyValueStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Value>, BtcError> {
        let path = self.entry_path(key);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|err| BtcError::Store(err.to_string()))?;
        let value = serde_json::from_str(&content)
            .map_err(|err| BtcError::Store(format!("corrupt entry {key}: {err}")))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, entry: &Value) -> Result<(), BtcError> {
        self.ensure_root()?;
        let content =
            serde_json::to_vec_pretty(entry).map_err(|err| BtcError::Serialization(err.to_string()))?;
        write_bytes_atomic(&self.entry_path(key), &content)
    }

    fn keys(&self) -> Result<Vec<String>, BtcError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(self.root.as_std_path()).map_err(|err| BtcError::Store(err.to_string()))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| BtcError::Store(err.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Some(key) = unescape_key(stem) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), BtcError> {
        let path = self.entry_path(key);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path()).map_err(|err| BtcError::Store(err.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, BtcError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BtcError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, entry: &Value) -> Result<(), BtcError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BtcError::Store("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BtcError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| BtcError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.keys().cloned().collect())
    }

    fn delete(&self, key: &str) -> Result<(), BtcError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BtcError::Store("memory store lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), BtcError> {
    let parent = path
        .parent()
        .ok_or_else(|| BtcError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| BtcError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".btc-entry")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BtcError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| BtcError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| BtcError::Filesystem(err.to_string()))?;
    Ok(())
}

fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        let keep = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_');
        if keep {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = name.get(index + 1..index + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).ok()
}
