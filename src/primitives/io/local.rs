use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::{normalize_path, BlobWriter, FileStore};
use crate::types::{OffloadError, Result};

const STAGING_SUFFIX: &str = ".inprogress";

/// File store rooted at a local directory.
///
/// Writes are staged in a hidden temporary file next to the target and renamed
/// into place on commit, so readers either see the previous blob, no blob, or
/// the complete new one.
#[derive(Clone, Debug)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory this store is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let normalized = normalize_path(path)?;
        let mut full = self.root.clone();
        for part in normalized.split('/') {
            full.push(part);
        }
        Ok((normalized, full))
    }
}

struct LocalWriter {
    path: String,
    target: PathBuf,
    staging: BufWriter<NamedTempFile>,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging.flush()
    }
}

impl BlobWriter for LocalWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn commit(self: Box<Self>) -> Result<u64> {
        let LocalWriter {
            path,
            target,
            staging,
        } = *self;
        let file = staging.into_inner().map_err(|err| err.into_error())?;
        file.as_file().sync_all()?;
        let len = file.as_file().metadata()?.len();
        file.persist(&target).map_err(|err| err.error)?;
        debug!(path = %path, bytes = len, "io.local.commit");
        Ok(len)
    }
}

impl FileStore for LocalFileStore {
    fn create(&self, path: &str) -> Result<Box<dyn BlobWriter>> {
        let (normalized, target) = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or(OffloadError::Invalid("path has no parent directory"))?;
        fs::create_dir_all(parent)?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(STAGING_SUFFIX)
            .tempfile_in(parent)?;
        Ok(Box::new(LocalWriter {
            path: normalized,
            target,
            staging: BufWriter::new(staging),
        }))
    }

    fn open(&self, path: &str) -> Result<Box<dyn BufRead + Send>> {
        let (normalized, full) = self.resolve(path)?;
        match File::open(&full) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(OffloadError::NotFound(format!("blob {normalized}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let (_, full) = self.resolve(path)?;
        Ok(full.is_file())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let (normalized, full) = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(OffloadError::NotFound(format!("blob {normalized}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let (normalized, full) = self.resolve(dir)?;
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            out.push(format!("{normalized}/{name}"));
        }
        out.sort();
        Ok(out)
    }
}
