//! Writer stage: batch rows per destination table and upsert them.
//!
//! A record's CheckpointEvent is emitted only after every table batch
//! containing one of its rows has committed, keeping the watermark honest
//! under at-least-once delivery. Batches flush at `batch_size` rows or
//! after a short lull in incoming jobs.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::destination::Destination;
use crate::error::{MigrateError, Result};
use crate::mapping::CompiledMapping;
use crate::migrator::job::{CheckpointEvent, WriterJob};
use crate::migrator::stats::Stats;
use crate::value::SqlValue;

/// Flush non-empty batches after this long without a new job.
const FLUSH_IDLE: Duration = Duration::from_millis(200);

/// Bounded retry schedule for destination writes.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct WriterContext {
    pub mapping: Arc<CompiledMapping>,
    pub dest: Arc<dyn Destination>,
    pub batch_size: usize,
    pub stats: Arc<Stats>,
}

/// A record's outstanding table batches; its ack fires at zero.
struct PendingAck {
    post_offset: u64,
    remaining: usize,
}

#[derive(Default)]
struct TableBatch {
    rows: Vec<Vec<SqlValue>>,
    seqs: Vec<u64>,
}

pub(crate) async fn run_writer(
    id: usize,
    ctx: Arc<WriterContext>,
    rx: async_channel::Receiver<WriterJob>,
    cp_tx: mpsc::Sender<CheckpointEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("writer {} start", id);

    // Schema problems must surface before any write happens.
    ctx.dest.validate_mapping(&ctx.mapping).await?;

    let mut batches: Vec<TableBatch> = (0..ctx.mapping.tables.len())
        .map(|_| TableBatch::default())
        .collect();
    let mut pending: HashMap<u64, PendingAck> = HashMap::new();

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => {
                // Unflushed rows are abandoned; the checkpoint never
                // advanced past them, so a resumed run re-delivers.
                debug!("writer {} canceled with {} pending records", id, pending.len());
                return Ok(());
            }
            job = rx.recv() => match job {
                Ok(job) => Some(job),
                Err(_) => None, // closed and drained
            },
            _ = tokio::time::sleep(FLUSH_IDLE), if !pending.is_empty() => {
                flush_all(id, &ctx, &mut batches, &mut pending, &cp_tx, &cancel).await?;
                continue;
            }
        };

        let Some(job) = job else { break };

        let seq = job.seq;
        if job.rows.is_empty() {
            let event = CheckpointEvent {
                worker_id: id,
                seq,
                post_offset: job.post_offset,
            };
            let _ = cp_tx.send(event).await;
            continue;
        }

        pending.insert(
            seq,
            PendingAck {
                post_offset: job.post_offset,
                remaining: job.rows.len(),
            },
        );
        for row in job.rows {
            let table_index = row.table_index;
            batches[table_index].rows.push(row.values);
            batches[table_index].seqs.push(seq);
            if batches[table_index].rows.len() >= ctx.batch_size {
                flush_table(id, &ctx, table_index, &mut batches, &mut pending, &cp_tx, &cancel)
                    .await?;
            }
        }
    }

    flush_all(id, &ctx, &mut batches, &mut pending, &cp_tx, &cancel).await?;
    debug!("writer {} exit", id);
    Ok(())
}

async fn flush_all(
    id: usize,
    ctx: &WriterContext,
    batches: &mut [TableBatch],
    pending: &mut HashMap<u64, PendingAck>,
    cp_tx: &mpsc::Sender<CheckpointEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    for table_index in 0..batches.len() {
        if !batches[table_index].rows.is_empty() {
            flush_table(id, ctx, table_index, batches, pending, cp_tx, cancel).await?;
        }
    }
    Ok(())
}

/// Commit one table's batch with bounded retries, then acknowledge every
/// record whose last outstanding batch this was.
async fn flush_table(
    id: usize,
    ctx: &WriterContext,
    table_index: usize,
    batches: &mut [TableBatch],
    pending: &mut HashMap<u64, PendingAck>,
    cp_tx: &mpsc::Sender<CheckpointEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let batch = std::mem::take(&mut batches[table_index]);
    if batch.rows.is_empty() {
        return Ok(());
    }
    let table = &ctx.mapping.tables[table_index];

    let mut attempt = 0u32;
    loop {
        match ctx.dest.upsert(table, &batch.rows).await {
            Ok(_) => break,
            Err(e) => {
                attempt += 1;
                if cancel.is_cancelled() {
                    // No further retries once shutdown is underway.
                    debug!("writer {}: abandoning batch for {} on cancel", id, table.name);
                    return Ok(());
                }
                if attempt >= MAX_WRITE_ATTEMPTS {
                    return Err(MigrateError::DestinationWrite(format!(
                        "writer {}: giving up on {} after {} attempts: {}",
                        id, table.name, attempt, e
                    )));
                }
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    "writer {}: write to {} failed (attempt {}/{}), retrying in {:?}: {}",
                    id, table.name, attempt, MAX_WRITE_ATTEMPTS, delay, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    ctx.stats
        .rows_written
        .fetch_add(batch.rows.len() as u64, Ordering::Relaxed);
    ctx.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);

    for seq in batch.seqs {
        if let Some(ack) = pending.get_mut(&seq) {
            ack.remaining -= 1;
            if ack.remaining == 0 {
                let event = CheckpointEvent {
                    worker_id: id,
                    seq,
                    post_offset: ack.post_offset,
                };
                pending.remove(&seq);
                if cp_tx.send(event).await.is_err() {
                    // Checkpointer is gone; keep flushing, acks are moot.
                    debug!("writer {}: checkpoint channel closed", id);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::valid_config;
    use crate::destination::testing::MemDestination;
    use crate::migrator::job::TableRow;

    fn writer_setup(
        dest: Arc<MemDestination>,
        batch_size: usize,
    ) -> (
        Arc<WriterContext>,
        async_channel::Sender<WriterJob>,
        async_channel::Receiver<WriterJob>,
        mpsc::Sender<CheckpointEvent>,
        mpsc::Receiver<CheckpointEvent>,
    ) {
        let (_dir, config) = valid_config();
        let mapping = Arc::new(CompiledMapping::compile(&config).unwrap());
        let ctx = Arc::new(WriterContext {
            mapping,
            dest,
            batch_size,
            stats: Arc::new(Stats::default()),
        });
        let (tx, rx) = async_channel::bounded(16);
        let (cp_tx, cp_rx) = mpsc::channel(100);
        (ctx, tx, rx, cp_tx, cp_rx)
    }

    fn make_job(seq: u64, id_value: i64) -> WriterJob {
        WriterJob {
            seq,
            post_offset: (seq + 1) * 10,
            rows: vec![TableRow {
                table_index: 0,
                values: vec![SqlValue::Int(id_value), SqlValue::Text("t".into())],
            }],
        }
    }

    #[tokio::test]
    async fn test_writes_and_acks() {
        let dest = Arc::new(MemDestination::new());
        let (ctx, tx, rx, cp_tx, mut cp_rx) = writer_setup(dest.clone(), 2);

        let handle = tokio::spawn(run_writer(
            0,
            ctx,
            rx,
            cp_tx,
            CancellationToken::new(),
        ));

        for seq in 0..3 {
            tx.send(make_job(seq, seq as i64)).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(dest.row_count("docs"), 3);

        let mut acked: Vec<u64> = Vec::new();
        while let Ok(ev) = cp_rx.try_recv() {
            acked.push(ev.seq);
        }
        acked.sort_unstable();
        assert_eq!(acked, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_upsert_collapses_duplicate_keys() {
        let dest = Arc::new(MemDestination::new());
        let (ctx, tx, rx, cp_tx, _cp_rx) = writer_setup(dest.clone(), 10);

        let handle = tokio::spawn(run_writer(
            0,
            ctx,
            rx,
            cp_tx,
            CancellationToken::new(),
        ));

        // Same key twice: second write wins, row count stays 1.
        tx.send(make_job(0, 42)).await.unwrap();
        tx.send(make_job(1, 42)).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(dest.row_count("docs"), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        tokio::time::pause();
        let dest = Arc::new(MemDestination::failing_first(2));
        let (ctx, tx, rx, cp_tx, mut cp_rx) = writer_setup(dest.clone(), 1);

        let handle = tokio::spawn(run_writer(
            0,
            ctx,
            rx,
            cp_tx,
            CancellationToken::new(),
        ));

        tx.send(make_job(0, 1)).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(dest.row_count("docs"), 1);
        assert!(cp_rx.try_recv().is_ok());
        // 2 failures + 1 success.
        assert_eq!(dest.upsert_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_fatal() {
        tokio::time::pause();
        let dest = Arc::new(MemDestination::failing_first(100));
        let (ctx, tx, rx, cp_tx, _cp_rx) = writer_setup(dest.clone(), 1);

        let handle = tokio::spawn(run_writer(
            0,
            ctx,
            rx,
            cp_tx,
            CancellationToken::new(),
        ));

        tx.send(make_job(0, 1)).await.unwrap();
        drop(tx);
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, MigrateError::DestinationWrite(_)));
    }

    #[tokio::test]
    async fn test_idle_flush() {
        let dest = Arc::new(MemDestination::new());
        // Batch size large enough that only the idle timer can flush.
        let (ctx, tx, rx, cp_tx, mut cp_rx) = writer_setup(dest.clone(), 100);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_writer(0, ctx, rx, cp_tx, cancel.clone()));

        tx.send(make_job(0, 1)).await.unwrap();

        // Wait for the idle flush to kick in.
        let ev = tokio::time::timeout(Duration::from_secs(5), cp_rx.recv())
            .await
            .expect("idle flush did not happen")
            .expect("checkpoint channel closed");
        assert_eq!(ev.seq, 0);
        assert_eq!(dest.row_count("docs"), 1);

        drop(tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_abandons_pending() {
        let dest = Arc::new(MemDestination::new());
        let (ctx, tx, rx, cp_tx, mut cp_rx) = writer_setup(dest.clone(), 100);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_writer(0, ctx, rx, cp_tx, cancel.clone()));

        tx.send(make_job(0, 1)).await.unwrap();
        // Cancel before the idle flush window elapses.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // Nothing was committed, nothing acked.
        assert_eq!(dest.row_count("docs"), 0);
        assert!(cp_rx.try_recv().is_err());
    }
}
