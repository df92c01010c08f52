use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::KeyValueStore;
use crate::error::{Result, SyncError};

const FILE_EXTENSION: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// Stores each key as a pretty-printed JSON file under one directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::persistence(&format!("Failed to create {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), FILE_EXTENSION))
    }
}

/// Percent-encode anything outside `[A-Za-z0-9._-]` so keys are safe file names.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::persistence(&format!("Failed to read {}", key), e)),
        };
        let value = serde_json::from_str(&contents)
            .map_err(|e| SyncError::persistence(&format!("Failed to parse {}", key), e))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key);
        // Unique per write so concurrent sets of one key never share a temp file
        let mut temp = path.clone().into_os_string();
        temp.push(format!(".{}{}", Uuid::new_v4().simple(), TEMP_SUFFIX));
        let contents = serde_json::to_string_pretty(&value)?;

        tokio::fs::write(&temp, contents)
            .await
            .map_err(|e| SyncError::persistence(&format!("Failed to write {}", key), e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| SyncError::persistence(&format!("Failed to commit {}", key), e))?;
        debug!(key, "Stored value");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::persistence(&format!("Failed to delete {}", key), e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| SyncError::persistence("Failed to list store directory", e))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::persistence("Failed to list store directory", e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(FILE_EXTENSION) else { continue };
            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => warn!(file = name, "Skipping file with undecodable name"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
