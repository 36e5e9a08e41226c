#![forbid(unsafe_code)]

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::types::{OffloadError, Result};

mod local;
mod mem;

pub use local::LocalFileStore;
pub use mem::{MemFileStore, WriteFault};

/// Handle to a blob being written.
///
/// Nothing written through the handle is visible at its path until
/// [`BlobWriter::commit`] returns. Dropping the handle without committing
/// discards everything written so far.
pub trait BlobWriter: Write + Send {
    /// Path the blob is published under on commit.
    fn path(&self) -> &str;
    /// Flushes, closes and atomically publishes the blob. Returns its length in bytes.
    fn commit(self: Box<Self>) -> Result<u64>;
}

/// Trait for slash-addressed blob storage.
pub trait FileStore: Send + Sync {
    /// Starts writing a blob at `path`, replacing any blob already there once committed.
    fn create(&self, path: &str) -> Result<Box<dyn BlobWriter>>;
    /// Opens the blob at `path` for sequential reading.
    fn open(&self, path: &str) -> Result<Box<dyn BufRead + Send>>;
    /// Returns true if a committed blob exists at `path`.
    fn exists(&self, path: &str) -> Result<bool>;
    /// Removes the blob at `path`.
    fn remove(&self, path: &str) -> Result<()>;
    /// Lists committed blobs directly under the directory `dir`, sorted.
    fn list(&self, dir: &str) -> Result<Vec<String>>;
}

impl<F: FileStore + ?Sized> FileStore for &F {
    fn create(&self, path: &str) -> Result<Box<dyn BlobWriter>> {
        (**self).create(path)
    }
    fn open(&self, path: &str) -> Result<Box<dyn BufRead + Send>> {
        (**self).open(path)
    }
    fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path)
    }
    fn remove(&self, path: &str) -> Result<()> {
        (**self).remove(path)
    }
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        (**self).list(dir)
    }
}

impl<F: FileStore + ?Sized> FileStore for Arc<F> {
    fn create(&self, path: &str) -> Result<Box<dyn BlobWriter>> {
        (**self).create(path)
    }
    fn open(&self, path: &str) -> Result<Box<dyn BufRead + Send>> {
        (**self).open(path)
    }
    fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path)
    }
    fn remove(&self, path: &str) -> Result<()> {
        (**self).remove(path)
    }
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        (**self).list(dir)
    }
}

/// Validates a slash-delimited path and returns it without leading, trailing or
/// repeated slashes.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(OffloadError::Invalid("path must not contain '..'")),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(OffloadError::Invalid("path must not be empty"));
    }
    Ok(parts.join("/"))
}

/// Joins two slash-delimited path fragments.
pub fn join_path(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_owned(),
        (_, true) => base.to_owned(),
        _ => format!("{base}/{rel}"),
    }
}

/// Reads every line of the blob at `path`.
pub fn read_lines(store: &dyn FileStore, path: &str) -> Result<Vec<String>> {
    let reader = store.open(path)?;
    reader
        .lines()
        .collect::<io::Result<Vec<_>>>()
        .map_err(OffloadError::from)
}
