//! Document access for signing and verification.

use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::container;

const PDF_HEADER: &[u8] = b"%PDF-";

/// Supplies document bytes and the range of them that gets hashed.
///
/// The default canonical range is everything in front of an embedded
/// signature container, so a signed file hashes to the same digest as the
/// original.
pub trait DocumentSource {
    fn read_document_bytes(&self) -> io::Result<Vec<u8>>;

    fn canonical_range(&self, bytes: &[u8]) -> Range<usize> {
        container::content_range(bytes)
    }
}

/// A document on disk.
#[derive(Debug, Clone)]
pub struct FileDocument {
    path: PathBuf,
}

impl FileDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentSource for FileDocument {
    fn read_document_bytes(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// An in-memory document.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocument(pub Vec<u8>);

impl DocumentSource for MemoryDocument {
    fn read_document_bytes(&self) -> io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// True when `bytes` start with a PDF header.
///
/// Signing does not require a PDF; callers use this to warn.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_HEADER)
}
