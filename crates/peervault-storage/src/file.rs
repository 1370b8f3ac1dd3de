//! File-backed storage backend.
//!
//! One file per key under a root directory. Keys are percent-encoded so any
//! UTF-8 key maps to a safe, reversible file name. Writes go through a
//! temporary sibling and a rename, which keeps each key atomic on POSIX
//! filesystems. Reads go through a bounded LRU cache; writes invalidate
//! then re-cache.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::cache::{CacheConfig, ReadCache};
use crate::error::StorageError;
use crate::{Result, Storage};

/// Characters stored verbatim in file names; everything else is `%XX`.
fn is_plain(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        if is_plain(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{b:02X}"));
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
            let hi = bytes.get(i + 1)?;
            let lo = bytes.get(i + 2)?;
            let hex = [*hi, *lo];
            let s = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(s, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// File-per-key storage with a bounded read cache.
pub struct FileStorage {
    root: PathBuf,
    cache: ReadCache,
}

impl FileStorage {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root directory cannot be created.
    pub async fn open(root: impl AsRef<Path>, cache: CacheConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root.to_string_lossy(), e))?;
        debug!(root = %root.display(), "opened file storage");
        Ok(Self {
            root,
            cache: ReadCache::new(cache),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit));
        }

        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => {
                self.cache.put(key, &bytes);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.cache.invalidate(key);

        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp-write");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::io(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        self.cache.put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(prefix, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(prefix, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp-write") {
                continue;
            }
            if let Some(key) = decode_key(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.cache.get(key).is_some() {
            return Ok(true);
        }
        Ok(tokio::fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| StorageError::io(key, e))?)
    }
}
