//! Temp-file-then-rename writes.
//!
//! A reader of `final_path` sees either the previous file or the complete
//! new one. The temporary name never matches a payload file name, so a
//! write interrupted at any point leaves nothing a loader would accept.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, warn};

const TEMP_MARKER: &str = ".tokensign-tmp-";

/// Atomic file writer with commit/abort semantics.
pub struct AtomicFile {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl AtomicFile {
    /// Create the temporary file next to `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let file_name = final_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let suffix: u64 = rand::thread_rng().gen();
        let temp_path =
            final_path.with_file_name(format!("{}{}{:016x}", file_name, TEMP_MARKER, suffix));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            bytes_written: 0,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(finalized)?;
        file.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync the temporary file without publishing it.
    pub fn sync(&mut self) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(finalized)?;
        file.flush()?;
        file.sync_all()
    }

    /// Rename the temporary file over the final path.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        let mut file = self.file.take().ok_or_else(finalized)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&self.temp_path, &self.final_path) {
            remove_quietly(&self.temp_path);
            return Err(e);
        }
        sync_parent(&self.final_path);
        debug!(
            path = %self.final_path.display(),
            bytes = self.bytes_written,
            "Committed atomic write"
        );
        Ok(self.final_path.clone())
    }

    /// Discard the temporary file.
    pub fn abort(mut self) {
        self.file.take();
        remove_quietly(&self.temp_path);
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            remove_quietly(&self.temp_path);
        }
    }
}

/// Write `data` to `path` atomically.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> io::Result<PathBuf> {
    let mut file = AtomicFile::create(path)?;
    file.write_all(data)?;
    file.commit()
}

/// True for names produced by [`AtomicFile`].
pub fn is_temp_name(name: &str) -> bool {
    name.contains(TEMP_MARKER)
}

fn finalized() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "atomic writer already finalized")
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
