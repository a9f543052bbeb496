//! Checkpoint persistence for resumable runs.
//!
//! A checkpoint is a small human-readable JSON document next to a binary
//! index file. The document carries the path of the index, the highest
//! durably-acknowledged uncompressed offset, and run timestamps; the index
//! holds the decompressor restore points generated by a full scan on the
//! first run.
//!
//! The checkpoint is created once, mutated only by the checkpointer task,
//! and never reused after `completed_at` is set. Persistence is atomic:
//! write to a temp sibling, fsync, rename.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SourceFileType;
use crate::error::{MigrateError, Result};
use crate::gzindex::Index;
use crate::source::generate_index;

/// Suffix of the index file written next to the checkpoint document.
pub const INDEX_SUFFIX: &str = ".index";

/// Persisted progress document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Path of the sibling file holding the serialized index.
    pub index_file: PathBuf,

    /// Highest uncompressed offset known to be durably written.
    pub index_offset: u64,

    /// Source dump this checkpoint belongs to.
    pub source_file: PathBuf,

    /// When the migration first started.
    pub started_at: DateTime<Utc>,

    /// When this document was last persisted.
    pub last_updated: DateTime<Utc>,

    /// Set exactly once, on clean termination past end-of-stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Load an existing checkpoint and its index, or create both by scanning
    /// the source.
    pub fn load_or_create(
        checkpoint_file: &Path,
        source_file: &Path,
        file_type: SourceFileType,
        index_interval: u64,
    ) -> Result<(Checkpoint, Index)> {
        if checkpoint_file.exists() {
            debug!("loading checkpoint file {}", checkpoint_file.display());
            Self::load_with_index(checkpoint_file)
        } else {
            debug!("creating checkpoint file {}", checkpoint_file.display());
            Self::create(checkpoint_file, source_file, file_type, index_interval)
        }
    }

    /// Load a checkpoint document, refusing completed ones.
    pub fn load(path: &Path) -> Result<Checkpoint> {
        let content = std::fs::read_to_string(path)?;
        let cp: Checkpoint = serde_json::from_str(&content)?;

        if cp.completed_at.is_some() {
            return Err(MigrateError::Config(format!(
                "checkpoint {} belongs to a completed migration; \
                 remove it to start over",
                path.display()
            )));
        }

        Ok(cp)
    }

    /// Load a checkpoint document together with its index file.
    pub fn load_with_index(path: &Path) -> Result<(Checkpoint, Index)> {
        let cp = Self::load(path)?;
        let index_file = File::open(&cp.index_file).map_err(|e| {
            MigrateError::Config(format!(
                "cannot open index file {}: {}",
                cp.index_file.display(),
                e
            ))
        })?;
        let index = Index::load(&mut BufReader::new(index_file))?;
        info!(
            "resuming from offset {} with {} index points",
            cp.index_offset,
            index.len()
        );
        Ok((cp, index))
    }

    /// First-run path: scan the source to build the index, then write the
    /// index file and a fresh checkpoint document.
    fn create(
        checkpoint_file: &Path,
        source_file: &Path,
        file_type: SourceFileType,
        index_interval: u64,
    ) -> Result<(Checkpoint, Index)> {
        let started = std::time::Instant::now();
        let index = generate_index(source_file, file_type, index_interval)?;
        info!(
            "indexed {} in {:.1?} ({} restore points)",
            source_file.display(),
            started.elapsed(),
            index.len()
        );

        let mut index_path = checkpoint_file.as_os_str().to_owned();
        index_path.push(INDEX_SUFFIX);
        let index_path = PathBuf::from(index_path);

        let index_file = File::create(&index_path)?;
        let mut writer = BufWriter::new(index_file);
        index.save(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let now = Utc::now();
        let mut cp = Checkpoint {
            index_file: index_path,
            index_offset: 0,
            source_file: source_file.to_path_buf(),
            started_at: now,
            last_updated: now,
            completed_at: None,
        };
        cp.save(checkpoint_file)?;

        Ok((cp, index))
    }

    /// Persist the document atomically: temp sibling, fsync, rename.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Utc::now();

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Record clean completion. Called at most once, by the checkpointer.
    pub fn mark_completed(&mut self) {
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_gzip(path: &Path, data: &[u8]) {
        let file = File::create(path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.gz");
        let cp_path = dir.path().join("checkpoint.json");
        write_gzip(&source, b"{\"a\":1}\n{\"a\":2}\n");

        let (cp, index) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4).unwrap();
        assert_eq!(cp.index_offset, 0);
        assert!(cp.completed_at.is_none());
        assert!(cp.index_file.exists());
        assert!(!index.is_empty());

        // Second call loads rather than regenerating.
        let (loaded, loaded_index) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4).unwrap();
        assert_eq!(loaded.started_at, cp.started_at);
        assert_eq!(loaded_index.len(), index.len());
    }

    #[test]
    fn test_save_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.gz");
        let cp_path = dir.path().join("checkpoint.json");
        write_gzip(&source, b"{\"a\":1}\n");

        let (mut cp, _) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4096).unwrap();
        cp.index_offset = 8;
        cp.save(&cp_path).unwrap();

        // No temp file left behind.
        assert!(!cp_path.with_extension("tmp").exists());

        // The document is human-readable JSON with the expected keys.
        let content = std::fs::read_to_string(&cp_path).unwrap();
        assert!(content.contains('\n'));
        assert!(content.contains("\"index_offset\": 8"));
        assert!(content.contains("\"source_file\""));

        let loaded = Checkpoint::load(&cp_path).unwrap();
        assert_eq!(loaded.index_offset, 8);
    }

    #[test]
    fn test_completed_checkpoint_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.gz");
        let cp_path = dir.path().join("checkpoint.json");
        write_gzip(&source, b"{\"a\":1}\n");

        let (mut cp, _) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4096).unwrap();
        cp.mark_completed();
        cp.save(&cp_path).unwrap();

        let err = Checkpoint::load(&cp_path).unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_mark_completed_sets_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.gz");
        let cp_path = dir.path().join("checkpoint.json");
        write_gzip(&source, b"{\"a\":1}\n");

        let (mut cp, _) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4096).unwrap();
        cp.mark_completed();
        let first = cp.completed_at;
        cp.mark_completed();
        assert_eq!(cp.completed_at, first);
    }

    #[test]
    fn test_timestamps_are_iso8601_utc() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("dump.gz");
        let cp_path = dir.path().join("checkpoint.json");
        write_gzip(&source, b"{\"a\":1}\n");

        let (_cp, _) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 4096).unwrap();
        let content = std::fs::read_to_string(&cp_path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
        let started = doc["started_at"].as_str().unwrap();
        // chrono serializes DateTime<Utc> as RFC 3339 / ISO 8601 with Z.
        assert!(started.ends_with('Z') || started.contains("+00:00"));
    }
}
