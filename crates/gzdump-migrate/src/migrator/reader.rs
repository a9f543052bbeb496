//! Reader stage: splits the source into records and feeds the processors.
//!
//! Runs on a blocking thread (`spawn_blocking`) because the decompressor is
//! synchronous. Backpressure comes from the bounded job channel: when
//! processors fall behind, `send_blocking` parks the reader. Cancellation is
//! observed between records; an in-flight send always completes, and a
//! closed channel (every processor gone) unblocks the reader during
//! shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::migrator::job::ProcessorJob;
use crate::migrator::stats::Stats;
use crate::source::SourceStream;

const READ_CHUNK: usize = 64 * 1024;

/// Read records from `source` starting at `start_offset` until end of
/// stream, cancellation, or a closed channel.
///
/// Returns true when the reader reached a clean end-of-stream.
pub(crate) fn run_reader(
    mut source: SourceStream,
    start_offset: u64,
    max_record_len: usize,
    tx: async_channel::Sender<ProcessorJob>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
) -> Result<bool> {
    debug!("reader start at offset {}", start_offset);
    source.seek_to(start_offset)?;

    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK * 2);
    let mut chunk = vec![0u8; READ_CHUNK];
    // Uncompressed offset of buf[0].
    let mut base = start_offset;
    let mut seq = 0u64;
    // Start of the not-yet-scanned region of buf, to avoid rescanning.
    let mut scan_from = 0usize;

    loop {
        if cancel.is_cancelled() {
            debug!("reader canceled after {} records", seq);
            return Ok(false);
        }

        let n = source.read_bytes(&mut chunk)?;
        if n == 0 {
            // A final record without a terminator still counts; its resume
            // point is end-of-stream.
            if !buf.is_empty() {
                let post_offset = base + buf.len() as u64;
                let line = std::mem::take(&mut buf);
                if tx
                    .send_blocking(ProcessorJob {
                        seq,
                        line,
                        post_offset,
                    })
                    .is_err()
                {
                    return Ok(false);
                }
                seq += 1;
                stats.records_read.fetch_add(1, Ordering::Relaxed);
            }
            debug!("reader reached end of stream after {} records", seq);
            return Ok(true);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut consumed = 0usize;
        while let Some(pos) = buf[scan_from.max(consumed)..]
            .iter()
            .position(|&b| b == b'\n')
        {
            let newline = scan_from.max(consumed) + pos;
            let line = buf[consumed..newline].to_vec();
            let post_offset = base + newline as u64 + 1;

            if line.len() > max_record_len {
                return Err(MigrateError::OversizeRecord {
                    offset: base + consumed as u64,
                    limit: max_record_len,
                });
            }

            if tx
                .send_blocking(ProcessorJob {
                    seq,
                    line,
                    post_offset,
                })
                .is_err()
            {
                // Every receiver is gone; the pipeline is shutting down.
                return Ok(false);
            }
            seq += 1;
            stats.records_read.fetch_add(1, Ordering::Relaxed);

            consumed = newline + 1;
            scan_from = consumed;
            if cancel.is_cancelled() {
                debug!("reader canceled after {} records", seq);
                return Ok(false);
            }
        }

        if consumed > 0 {
            buf.drain(..consumed);
            base += consumed as u64;
        }
        scan_from = buf.len();

        if buf.len() > max_record_len {
            return Err(MigrateError::OversizeRecord {
                offset: base,
                limit: max_record_len,
            });
        }
    }
}
