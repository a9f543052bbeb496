//! Migration supervisor.
//!
//! [`Migrator`] wires the pipeline: a blocking reader thread feeding a
//! bounded job channel, a processor pool, a writer pool, and a single
//! checkpointer, all sharing one cancellation token. The supervisor listens
//! for external cancellation, reader completion, and fatal stage errors,
//! then walks the stages down in order with a bounded timeout per stage.

mod checkpointer;
mod job;
mod processor;
mod reader;
mod stats;
mod watermark;
mod writer;

pub use job::{CheckpointEvent, ProcessorJob, TableRow, TerminationCause, WriterJob};
pub use stats::{Stats, StatsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::dedup::DedupSet;
use crate::destination::{self, Destination};
use crate::error::{MigrateError, Result};
use crate::gzindex::Index;
use crate::mapping::CompiledMapping;
use crate::source::SourceStream;

use checkpointer::Checkpointer;
use processor::ProcessorContext;
use writer::WriterContext;

/// Per-stage shutdown timeout.
const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the checkpoint-event channel.
const CHECKPOINT_CHANNEL_CAPACITY: usize = 10_000;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Final status.
    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished.
    pub finished_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Records read from the source this run.
    pub records_read: u64,

    /// Rows written to the destination this run.
    pub rows_written: u64,

    /// Records skipped as in-run duplicates.
    pub duplicates_skipped: u64,

    /// Records dropped due to unconvertible values.
    pub conversion_errors: u64,

    /// Records dropped due to missing required fields.
    pub missing_required: u64,

    /// Average throughput (records/second).
    pub records_per_second: u64,

    /// Highest durably-acknowledged offset, if any record completed.
    pub final_offset: Option<u64>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Migration supervisor. Construct with [`Migrator::new`], then [`Migrator::run`].
pub struct Migrator {
    config: Config,
    mapping: Arc<CompiledMapping>,
    dest: Arc<dyn Destination>,
    checkpoint: Option<Checkpoint>,
    checkpoint_path: PathBuf,
    index: Index,
}

impl Migrator {
    /// Validate configuration, connect to the destination, and load or
    /// create the checkpoint (scanning the source to build its index on a
    /// first run).
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_resume(config, true).await
    }

    /// Like [`Migrator::new`]; with `resume` false an existing unfinished
    /// checkpoint (and its index) is discarded and the run starts fresh.
    pub async fn with_resume(config: Config, resume: bool) -> Result<Self> {
        config.validate()?;
        let mapping = Arc::new(CompiledMapping::compile(&config)?);

        let pool_size = config.pipeline.effective_num_writers() + 1;
        let dest = destination::connect(&config.destination, pool_size).await?;

        let checkpoint_path = config.pipeline.effective_checkpoint_file();
        let (checkpoint, index) = if config.pipeline.disable_checkpointing {
            info!("checkpointing disabled; starting from offset 0");
            (None, Index::empty())
        } else {
            if !resume && checkpoint_path.exists() {
                info!(
                    "resume disabled; removing existing checkpoint {}",
                    checkpoint_path.display()
                );
                // Unlike a resume, a fresh start may discard a completed
                // checkpoint too.
                let content = std::fs::read_to_string(&checkpoint_path)?;
                if let Ok(old) = serde_json::from_str::<Checkpoint>(&content) {
                    let _ = std::fs::remove_file(&old.index_file);
                }
                std::fs::remove_file(&checkpoint_path)?;
            }

            let cp_path = checkpoint_path.clone();
            let source_file = config.source.file.clone();
            let file_type = config.source.file_type;
            let interval = config.pipeline.effective_index_interval();
            let (cp, index) = tokio::task::spawn_blocking(move || {
                Checkpoint::load_or_create(&cp_path, &source_file, file_type, interval)
            })
            .await
            .map_err(|e| {
                MigrateError::Io(std::io::Error::other(format!(
                    "checkpoint preparation task failed: {}",
                    e
                )))
            })??;
            (Some(cp), index)
        };

        Ok(Self {
            config,
            mapping,
            dest,
            checkpoint,
            checkpoint_path,
            index,
        })
    }

    /// Dry run: validate configuration, destination connectivity and schema
    /// compatibility without touching the source or writing any state.
    pub async fn preflight(config: &Config) -> Result<()> {
        config.validate()?;
        let mapping = CompiledMapping::compile(config)?;
        let dest = destination::connect(&config.destination, 1).await?;
        dest.ping().await?;
        dest.validate_mapping(&mapping).await?;
        info!("destination schema matches the mapping");
        Ok(())
    }

    /// Run the migration until end-of-stream, cancellation, or a fatal
    /// error.
    pub async fn run(self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let stats = Arc::new(Stats::default());

        let pipeline = &self.config.pipeline;
        let num_processors = pipeline.effective_num_processors();
        let num_writers = pipeline.effective_num_writers();
        let start_offset = self.checkpoint.as_ref().map(|c| c.index_offset).unwrap_or(0);

        info!(
            "starting pipeline: {} processors, {} writers, batch size {}, offset {}",
            num_processors,
            num_writers,
            pipeline.effective_batch_size(),
            start_offset
        );

        // Bounded queues between stages.
        let (job_tx, job_rx) = async_channel::bounded::<ProcessorJob>(num_processors);
        let (writer_tx, writer_rx) = async_channel::bounded::<WriterJob>(num_writers);
        let (cp_tx, cp_rx) = mpsc::channel::<CheckpointEvent>(CHECKPOINT_CHANNEL_CAPACITY);
        let (term_tx, term_rx) = oneshot::channel::<TerminationCause>();
        let (err_tx, mut err_rx) = mpsc::channel::<MigrateError>(num_processors + num_writers);

        // Reader (owns the decompressor, blocking IO).
        let source = SourceStream::open(
            &self.config.source.file,
            self.config.source.file_type,
            self.index,
            pipeline.effective_index_interval(),
        )?;
        let max_record_len = pipeline.effective_max_record_len();
        let reader_cancel = cancel.clone();
        let reader_stats = stats.clone();
        let mut reader_handle = tokio::task::spawn_blocking(move || {
            reader::run_reader(
                source,
                start_offset,
                max_record_len,
                job_tx,
                reader_cancel,
                reader_stats,
            )
        });

        // Processor pool.
        let proc_ctx = Arc::new(ProcessorContext {
            mapping: self.mapping.clone(),
            dedup: (!pipeline.disable_dupecheck).then(|| Arc::new(DedupSet::new(num_processors))),
            contents: self.config.source.file_contents,
            stats: stats.clone(),
        });
        let mut processor_handles = Vec::with_capacity(num_processors);
        for id in 0..num_processors {
            let ctx = proc_ctx.clone();
            let rx = job_rx.clone();
            let wtx = writer_tx.clone();
            let ctx_cp_tx = cp_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();
            processor_handles.push(tokio::spawn(async move {
                if let Err(e) = processor::run_processor(id, ctx, rx, wtx, ctx_cp_tx, cancel).await
                {
                    let _ = err_tx.send(e).await;
                }
            }));
        }
        drop(job_rx);
        drop(writer_tx);

        // Writer pool.
        let writer_ctx = Arc::new(WriterContext {
            mapping: self.mapping.clone(),
            dest: self.dest.clone(),
            batch_size: pipeline.effective_batch_size(),
            stats: stats.clone(),
        });
        let mut writer_handles = Vec::with_capacity(num_writers);
        for id in 0..num_writers {
            let ctx = writer_ctx.clone();
            let rx = writer_rx.clone();
            let wcp_tx = cp_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = cancel.clone();
            writer_handles.push(tokio::spawn(async move {
                if let Err(e) = writer::run_writer(id, ctx, rx, wcp_tx, cancel).await {
                    let _ = err_tx.send(e).await;
                }
            }));
        }
        drop(writer_rx);
        drop(cp_tx);
        drop(err_tx);

        // Checkpointer.
        let cpr = Checkpointer::new(
            self.checkpoint,
            self.checkpoint_path.clone(),
            pipeline.effective_checkpoint_interval(),
        );
        let checkpointer_handle = tokio::spawn(cpr.run(cp_rx, term_rx));

        // Progress reporter.
        let progress_cancel = cancel.child_token();
        let progress_handle = tokio::spawn(run_progress(
            stats.clone(),
            pipeline.effective_report_interval(),
            progress_cancel.clone(),
        ));

        // Supervise until something ends the steady state.
        let mut fatal: Option<MigrateError> = None;
        let mut clean_eof = false;
        let mut reader_done = false;
        let mut cancelled = false;

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cancellation requested, shutting down");
                cancelled = true;
            }
            res = &mut reader_handle => {
                reader_done = true;
                match flatten_reader(res) {
                    Ok(clean) => {
                        clean_eof = clean;
                        debug!("reader finished (clean={})", clean);
                    }
                    Err(e) => {
                        error!("reader failed: {}", e);
                        fatal = Some(e);
                    }
                }
            }
            Some(e) = err_rx.recv() => {
                error!("pipeline stage failed: {}", e);
                fatal = Some(e);
            }
        }

        // Ordered shutdown. An interrupted or failing run cancels everything
        // up front; a clean run lets the stages drain naturally.
        if cancelled || fatal.is_some() {
            cancel.cancel();
        }
        let mut timeout_stage: Option<&'static str> = None;

        // (1) Reader.
        if !reader_done {
            match tokio::time::timeout(STAGE_TIMEOUT, &mut reader_handle).await {
                Ok(res) => match flatten_reader(res) {
                    Ok(clean) => clean_eof = clean,
                    Err(e) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                },
                Err(_) => {
                    warn!("reader did not stop within {:?}", STAGE_TIMEOUT);
                    timeout_stage = Some("reader");
                }
            }
        }

        // (2) Processors drain the closed job channel.
        if join_stage("processor pool", processor_handles).await {
            timeout_stage.get_or_insert("processor pool");
        }

        // (3) Writers drain the closed writer channel and flush.
        if join_stage("writer pool", writer_handles).await {
            timeout_stage.get_or_insert("writer pool");
        }

        // (4) Checkpointer gets the termination cause and persists.
        let cause = if fatal.is_some() {
            TerminationCause::Fatal
        } else if cancelled || timeout_stage.is_some() || !clean_eof {
            TerminationCause::Canceled
        } else {
            TerminationCause::CleanEof
        };
        let _ = term_tx.send(cause);

        let mut final_offset = None;
        match tokio::time::timeout(STAGE_TIMEOUT, checkpointer_handle).await {
            Ok(Ok(Ok(outcome))) => {
                final_offset = outcome.high_water_mark;
            }
            Ok(Ok(Err(e))) => {
                error!("checkpointer failed: {}", e);
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
            Ok(Err(join_err)) => {
                if fatal.is_none() {
                    fatal = Some(MigrateError::Io(std::io::Error::other(format!(
                        "checkpointer task panicked: {}",
                        join_err
                    ))));
                }
            }
            Err(_) => {
                warn!("checkpointer did not stop within {:?}", STAGE_TIMEOUT);
                timeout_stage = Some("checkpointer");
            }
        }

        progress_cancel.cancel();
        let _ = progress_handle.await;

        // Late errors reported while we were shutting down.
        while let Ok(e) = err_rx.try_recv() {
            if fatal.is_none() {
                fatal = Some(e);
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if let Some(stage) = timeout_stage {
            return Err(MigrateError::ShutdownTimeout(stage));
        }

        let snapshot = stats.snapshot();
        let finished_at = Utc::now();
        let elapsed = start.elapsed().as_secs_f64();
        let result = MigrationResult {
            status: if clean_eof {
                RunStatus::Completed
            } else {
                RunStatus::Cancelled
            },
            started_at,
            finished_at,
            duration_seconds: elapsed,
            records_read: snapshot.records_read,
            rows_written: snapshot.rows_written,
            duplicates_skipped: snapshot.duplicates_skipped,
            conversion_errors: snapshot.conversion_errors,
            missing_required: snapshot.missing_required,
            records_per_second: if elapsed > 0.0 {
                (snapshot.records_read as f64 / elapsed) as u64
            } else {
                0
            },
            final_offset,
        };

        info!(
            "migration {:?}: {} records in {:.2}s ({} records/sec, {} rows written, \
             {} duplicates, {} conversion errors, {} missing required)",
            result.status,
            result.records_read,
            result.duration_seconds,
            result.records_per_second,
            result.rows_written,
            result.duplicates_skipped,
            result.conversion_errors,
            result.missing_required
        );

        Ok(result)
    }
}

fn flatten_reader(
    res: std::result::Result<Result<bool>, tokio::task::JoinError>,
) -> Result<bool> {
    match res {
        Ok(inner) => inner,
        Err(join_err) => Err(MigrateError::Io(std::io::Error::other(format!(
            "reader task panicked: {}",
            join_err
        )))),
    }
}

/// Join a pool of wrapped stage tasks; true when the stage timed out.
async fn join_stage(stage: &'static str, handles: Vec<JoinHandle<()>>) -> bool {
    let joined = tokio::time::timeout(STAGE_TIMEOUT, futures::future::join_all(handles)).await;
    match joined {
        Ok(results) => {
            for res in results {
                if let Err(e) = res {
                    warn!("{} task panicked: {}", stage, e);
                }
            }
            false
        }
        Err(_) => {
            warn!("{} did not stop within {:?}", stage, STAGE_TIMEOUT);
            true
        }
    }
}

/// Log throughput at a fixed cadence until canceled.
async fn run_progress(stats: Arc<Stats>, interval: Duration, cancel: CancellationToken) {
    let mut last = StatsSnapshot::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let snap = stats.snapshot();
                if snap == last {
                    continue;
                }
                let delta = snap.records_read - last.records_read;
                info!(
                    "progress: {} records read (+{}), {} rows written, {} dupes, {} errors",
                    snap.records_read,
                    delta,
                    snap.rows_written,
                    snap.duplicates_skipped,
                    snap.conversion_errors + snap.missing_required
                );
                last = snap;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::valid_config;
    use crate::config::{ConfigDuration, SourceFileType};
    use crate::destination::testing::MemDestination;
    use std::io::Write as _;
    use std::path::Path;

    fn write_gzip(path: &Path, data: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
    }

    /// Build a Migrator wired to an in-memory destination, bypassing
    /// `Migrator::new`'s real connection setup.
    async fn test_migrator(
        dir: &tempfile::TempDir,
        data: &[u8],
        dest: Arc<MemDestination>,
    ) -> Migrator {
        let (_cfg_dir, mut config) = valid_config();
        let source = dir.path().join("dump.ndjson.gz");
        write_gzip(&source, data);
        config.source.file = source.clone();
        config.pipeline.checkpoint_file = Some(dir.path().join("checkpoint.json"));
        config.pipeline.checkpoint_interval = Some(ConfigDuration(Duration::from_millis(1)));
        config.pipeline.num_processors = Some(2);
        config.pipeline.num_writers = Some(2);
        config.pipeline.batch_size = Some(2);
        config.pipeline.index_interval = Some(64);

        let mapping = Arc::new(CompiledMapping::compile(&config).unwrap());
        let checkpoint_path = config.pipeline.effective_checkpoint_file();
        let (cp, index) = Checkpoint::load_or_create(
            &checkpoint_path,
            &source,
            SourceFileType::Gzip,
            64,
        )
        .unwrap();

        Migrator {
            config,
            mapping,
            dest,
            checkpoint: Some(cp),
            checkpoint_path,
            index,
        }
    }

    const THREE_RECORDS: &[u8] = b"{\"id\":1,\"body\":{\"title\":\"a\"}}\n{\"id\":2,\"body\":{\"title\":\"b\"}}\n{\"id\":3,\"body\":{\"title\":\"c\"}}\n";

    #[tokio::test]
    async fn test_tiny_clean_run() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(MemDestination::new());
        let migrator = test_migrator(&dir, THREE_RECORDS, dest.clone()).await;
        let cp_path = migrator.checkpoint_path.clone();

        let result = migrator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.records_read, 3);
        assert_eq!(result.rows_written, 3);
        assert_eq!(dest.row_count("docs"), 3);
        assert_eq!(result.final_offset, Some(THREE_RECORDS.len() as u64));

        // Checkpoint is completed at the full stream length; reuse refused.
        let content = std::fs::read_to_string(&cp_path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(
            doc["index_offset"].as_u64(),
            Some(THREE_RECORDS.len() as u64)
        );
        assert!(doc["completed_at"].is_string());
        assert!(Checkpoint::load(&cp_path).is_err());
    }

    #[tokio::test]
    async fn test_malformed_record_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(MemDestination::new());
        let data = b"{\"id\":1}\n{\"id\":\"xyz\"}\n{\"id\":3}\n";
        let migrator = test_migrator(&dir, data, dest.clone()).await;

        let result = migrator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.conversion_errors, 1);
        assert_eq!(dest.row_count("docs"), 2);
        // The bad record did not wedge the watermark.
        assert_eq!(result.final_offset, Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_missing_required_field_drops_record_only() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(MemDestination::new());
        let data = b"{\"id\":1}\n{\"nope\":true}\n{\"id\":3}\n";
        let migrator = test_migrator(&dir, data, dest.clone()).await;

        let result = migrator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.missing_required, 1);
        assert_eq!(dest.row_count("docs"), 2);
        assert_eq!(result.final_offset, Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_duplicates_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Arc::new(MemDestination::new());
        let data = b"{\"id\":1}\n{\"id\":1}\n{\"id\":2}\n";
        let migrator = test_migrator(&dir, data, dest.clone()).await;

        let result = migrator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(result.duplicates_skipped, 1);
        assert_eq!(dest.row_count("docs"), 2);
        assert_eq!(result.final_offset, Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_interrupt_then_resume_reaches_same_state() {
        let dir = tempfile::tempdir().unwrap();

        // Many records so the cancel lands mid-run.
        let mut data = Vec::new();
        for i in 0..200 {
            data.extend_from_slice(format!("{{\"id\":{}}}\n", i).as_bytes());
        }

        // First run: writers are slowed down, then canceled mid-flight.
        let dest = Arc::new(MemDestination {
            write_delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let migrator = test_migrator(&dir, &data, dest.clone()).await;
        let cp_path = migrator.checkpoint_path.clone();
        let source = migrator.config.source.file.clone();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            canceller.cancel();
        });
        let result = migrator.run(cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        let partial = dest.row_count("docs");
        assert!(partial < 200, "cancel came too late to be a real test");

        // The interrupted checkpoint is resumable, not completed.
        let (cp, index) =
            Checkpoint::load_or_create(&cp_path, &source, SourceFileType::Gzip, 64).unwrap();
        assert!(cp.completed_at.is_none());
        assert!(cp.index_offset < data.len() as u64);

        // Second run from the checkpoint completes the job against the same
        // destination (upsert collapses any re-delivered records).
        let (_cfg_dir, mut config) = valid_config();
        config.source.file = source;
        config.pipeline.checkpoint_file = Some(cp_path.clone());
        config.pipeline.checkpoint_interval = Some(ConfigDuration(Duration::from_millis(1)));
        config.pipeline.num_processors = Some(2);
        config.pipeline.num_writers = Some(2);
        config.pipeline.batch_size = Some(10);
        config.pipeline.index_interval = Some(64);

        let dest2 = Arc::new(MemDestination::new());
        {
            // Carry over the rows already written, as a real database would.
            let mut stored = dest2.rows.lock().unwrap();
            *stored = dest.rows.lock().unwrap().clone();
        }
        let mapping = Arc::new(CompiledMapping::compile(&config).unwrap());
        let migrator2 = Migrator {
            config,
            mapping,
            dest: dest2.clone(),
            checkpoint: Some(cp),
            checkpoint_path: cp_path.clone(),
            index,
        };

        let result2 = migrator2.run(CancellationToken::new()).await.unwrap();
        assert_eq!(result2.status, RunStatus::Completed);
        assert_eq!(dest2.row_count("docs"), 200);

        let final_cp = std::fs::read_to_string(&cp_path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&final_cp).unwrap();
        assert_eq!(doc["index_offset"].as_u64(), Some(data.len() as u64));
        assert!(doc["completed_at"].is_string());
    }

    #[tokio::test]
    async fn test_fatal_writer_error_aborts_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        // Destination fails forever: retries exhaust and the run aborts.
        let dest = Arc::new(MemDestination::failing_first(usize::MAX));
        let migrator = test_migrator(&dir, THREE_RECORDS, dest).await;
        let cp_path = migrator.checkpoint_path.clone();

        let err = migrator.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::DestinationWrite(_)));

        // Nothing was acknowledged, so the checkpoint still points at 0 and
        // is not completed.
        let content = std::fs::read_to_string(&cp_path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(doc["index_offset"].as_u64(), Some(0));
        assert!(doc["completed_at"].is_null());
    }
}
