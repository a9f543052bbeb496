//! Source stream dispatch.
//!
//! The pipeline reads from a [`SourceStream`], which is either an indexed
//! gzip decompressor or a plain file. Plain files seek natively and produce
//! an empty index; the enum keeps the reader stage free of per-format
//! branches.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::config::SourceFileType;
use crate::error::{MigrateError, Result};
use crate::gzindex::{GzipReader, Index};

pub enum SourceStream {
    Gzip(Box<GzipReader<File>>),
    Plain(File),
}

impl SourceStream {
    /// Open the configured source, attaching `index` for gzip files.
    pub fn open(
        path: &Path,
        file_type: SourceFileType,
        index: Index,
        index_interval: u64,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| MigrateError::source_open(path, e))?;
        match file_type {
            SourceFileType::Gzip => {
                let mut reader = GzipReader::with_interval(file, index_interval)?;
                // An empty index would discard the reader's own stream-start
                // point; only a generated or loaded index replaces it.
                if !index.is_empty() {
                    reader = reader.with_index(index);
                }
                Ok(SourceStream::Gzip(Box::new(reader)))
            }
            SourceFileType::Plain => Ok(SourceStream::Plain(file)),
        }
    }

    /// Position the stream at `offset` in the uncompressed byte space.
    pub fn seek_to(&mut self, offset: u64) -> Result<u64> {
        match self {
            SourceStream::Gzip(r) => r.seek_uncompressed(SeekFrom::Start(offset)),
            SourceStream::Plain(f) => Ok(f.seek(SeekFrom::Start(offset))?),
        }
    }

    /// Pull uncompressed bytes; `Ok(0)` only at end of stream.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<usize> {
        match self {
            SourceStream::Gzip(r) => r.read_uncompressed(out),
            SourceStream::Plain(f) => Ok(f.read(out)?),
        }
    }
}

/// Scan a source end to end, building its restore-point index.
///
/// For gzip sources this decompresses the whole stream (verifying the
/// trailer on the way); plain files seek natively, so their index is empty.
pub fn generate_index(
    path: &Path,
    file_type: SourceFileType,
    index_interval: u64,
) -> Result<Index> {
    match file_type {
        SourceFileType::Gzip => {
            let file = File::open(path).map_err(|e| MigrateError::source_open(path, e))?;
            let mut reader = GzipReader::with_interval(file, index_interval)?;
            let mut buf = vec![0u8; 256 * 1024];
            loop {
                let n = reader.read_uncompressed(&mut buf)?;
                if n == 0 {
                    break;
                }
            }
            Ok(reader.into_index())
        }
        SourceFileType::Plain => Ok(Index::empty()),
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStream::Gzip(_) => f.write_str("SourceStream::Gzip"),
            SourceStream::Plain(_) => f.write_str("SourceStream::Plain"),
        }
    }
}

impl MigrateError {
    /// Wrap a source-open failure with the path for operator-friendly logs.
    pub(crate) fn source_open(path: &Path, e: std::io::Error) -> MigrateError {
        MigrateError::Config(format!("cannot open source file {}: {}", path.display(), e))
    }
}
