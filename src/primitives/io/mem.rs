use std::collections::BTreeMap;
use std::io::{self, BufRead, Cursor, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{normalize_path, BlobWriter, FileStore};
use crate::types::{OffloadError, Result};

/// Failure rule applied to writers whose path starts with `prefix`.
#[derive(Clone, Debug)]
pub struct WriteFault {
    /// Path prefix the rule applies to.
    pub prefix: String,
    /// Bytes a matching writer accepts before every further write fails.
    pub after_bytes: usize,
}

#[derive(Default)]
struct Inner {
    blobs: RwLock<BTreeMap<String, Arc<Vec<u8>>>>,
    faults: Mutex<Vec<WriteFault>>,
    triggered: Mutex<u64>,
}

/// File store that keeps committed blobs in memory.
///
/// Supports write-failure injection through [`MemFileStore::fail_writes`].
#[derive(Clone, Default)]
pub struct MemFileStore {
    inner: Arc<Inner>,
}

impl MemFileStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes writers for paths under `prefix` fail once they have accepted `after_bytes`.
    pub fn fail_writes(&self, prefix: &str, after_bytes: usize) {
        self.inner.faults.lock().push(WriteFault {
            prefix: prefix.trim_start_matches('/').to_owned(),
            after_bytes,
        });
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Number of writes rejected by injected faults so far.
    pub fn faults_triggered(&self) -> u64 {
        *self.inner.triggered.lock()
    }

    /// Returns a copy of the committed blob at `path`.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let path = normalize_path(path).ok()?;
        self.inner
            .blobs
            .read()
            .get(&path)
            .map(|blob| blob.as_ref().clone())
    }

    /// Writes and commits `bytes` at `path` in one step.
    pub fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut writer = self.create(path)?;
        writer.write_all(bytes)?;
        writer.commit()?;
        Ok(())
    }

    /// Paths of every committed blob, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.inner.blobs.read().keys().cloned().collect()
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

struct MemWriter {
    path: String,
    buf: Vec<u8>,
    limit: Option<usize>,
    inner: Arc<Inner>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.limit {
            if self.buf.len() + buf.len() > limit {
                let room = limit.saturating_sub(self.buf.len());
                if room == 0 {
                    *self.inner.triggered.lock() += 1;
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("injected write failure on {}", self.path),
                    ));
                }
                self.buf.extend_from_slice(&buf[..room]);
                return Ok(room);
            }
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn commit(self: Box<Self>) -> Result<u64> {
        let MemWriter {
            path, buf, inner, ..
        } = *self;
        let len = buf.len() as u64;
        inner.blobs.write().insert(path, Arc::new(buf));
        Ok(len)
    }
}

impl FileStore for MemFileStore {
    fn create(&self, path: &str) -> Result<Box<dyn BlobWriter>> {
        let path = normalize_path(path)?;
        let limit = self
            .inner
            .faults
            .lock()
            .iter()
            .filter(|fault| path.starts_with(&fault.prefix))
            .map(|fault| fault.after_bytes)
            .min();
        Ok(Box::new(MemWriter {
            path,
            buf: Vec::new(),
            limit,
            inner: Arc::clone(&self.inner),
        }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn BufRead + Send>> {
        let path = normalize_path(path)?;
        let blob = self
            .inner
            .blobs
            .read()
            .get(&path)
            .cloned()
            .ok_or_else(|| OffloadError::NotFound(format!("blob {path}")))?;
        Ok(Box::new(Cursor::new(SharedBytes(blob))))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        Ok(self.inner.blobs.read().contains_key(&path))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        self.inner
            .blobs
            .write()
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| OffloadError::NotFound(format!("blob {path}")))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_path(dir)?;
        let prefix = format!("{dir}/");
        Ok(self
            .inner
            .blobs
            .read()
            .keys()
            .filter(|path| {
                path.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}
