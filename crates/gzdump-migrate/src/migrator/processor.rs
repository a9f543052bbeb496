//! Processor stage: decode, map, convert, dedup.
//!
//! Per-record failures (missing required field, unconvertible value, parse
//! error) drop the record: they are counted and acknowledged straight to the
//! checkpointer, so the watermark still advances past them and a resumed run
//! does not replay a permanently bad record. Only bug-class errors tear the
//! pipeline down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FileContents;
use crate::dedup::DedupSet;
use crate::error::{MigrateError, Result};
use crate::mapping::CompiledMapping;
use crate::migrator::job::{CheckpointEvent, ProcessorJob, TableRow, WriterJob};
use crate::migrator::stats::Stats;
use crate::value::{convert, SqlValue};

/// Everything a processor worker needs, shared across the pool.
pub(crate) struct ProcessorContext {
    pub mapping: Arc<CompiledMapping>,
    pub dedup: Option<Arc<DedupSet>>,
    pub contents: FileContents,
    pub stats: Arc<Stats>,
}

pub(crate) async fn run_processor(
    id: usize,
    ctx: Arc<ProcessorContext>,
    rx: async_channel::Receiver<ProcessorJob>,
    writer_tx: async_channel::Sender<WriterJob>,
    cp_tx: mpsc::Sender<CheckpointEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("processor {} start", id);
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Ok(job) => job,
                Err(_) => break, // channel closed and drained
            },
        };

        let seq = job.seq;
        let post_offset = job.post_offset;
        match process_job(&ctx, job)? {
            Some(rows) => {
                let wj = WriterJob {
                    seq,
                    post_offset,
                    rows,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = writer_tx.send(wj) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                // Dropped record: acknowledge it directly so the watermark
                // can move past it.
                let event = CheckpointEvent {
                    worker_id: id,
                    seq,
                    post_offset,
                };
                if cp_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("processor {} exit", id);
    Ok(())
}

/// Turn one record into rows, or `None` when the record is dropped
/// (duplicate or per-record error).
fn process_job(ctx: &ProcessorContext, job: ProcessorJob) -> Result<Option<Vec<TableRow>>> {
    if ctx.contents != FileContents::Json {
        return Err(MigrateError::Config(format!(
            "source.file_contents {:?} is not supported for processing",
            ctx.contents
        )));
    }

    let doc: serde_json::Value = match serde_json::from_slice(&job.line) {
        Ok(doc) => doc,
        Err(e) => {
            ctx.stats.conversion_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "record at offset {} is not valid JSON, dropping: {}",
                job.post_offset, e
            );
            return Ok(None);
        }
    };

    let mut rows = Vec::with_capacity(ctx.mapping.tables.len());
    for (table_index, table) in ctx.mapping.tables.iter().enumerate() {
        let mut values = Vec::with_capacity(table.columns.len());
        for column in &table.columns {
            match resolve_path(&doc, &column.src_path) {
                Some(value) => match convert(&column.name, value, column.conv) {
                    Ok(v) => values.push(v),
                    Err(e) => {
                        ctx.stats.conversion_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "dropping record at offset {}: {}",
                            job.post_offset, e
                        );
                        return Ok(None);
                    }
                },
                None if column.required => {
                    ctx.stats.missing_required.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "dropping record at offset {}: required field '{}' missing",
                        job.post_offset,
                        column.src_path.join(".")
                    );
                    return Ok(None);
                }
                None => values.push(SqlValue::Null),
            }
        }
        rows.push(TableRow {
            table_index,
            values,
        });
    }

    // Duplicate suppression per target row; a record is skipped only when
    // every one of its rows has been seen before.
    if let Some(dedup) = &ctx.dedup {
        rows.retain(|row| {
            let table = &ctx.mapping.tables[row.table_index];
            let key_idx = table.dupe_check_indexes();
            if key_idx.is_empty() {
                return true;
            }
            let keys: Vec<&SqlValue> = key_idx.iter().map(|&i| &row.values[i]).collect();
            let fp = DedupSet::fingerprint(&table.name, &keys);
            !dedup.check_and_insert(fp)
        });
        if rows.is_empty() {
            ctx.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("record at offset {} is a duplicate, skipping", job.post_offset);
            return Ok(None);
        }
    }

    Ok(Some(rows))
}

/// Walk a dotted path into a JSON document.
fn resolve_path<'a>(doc: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = doc;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
