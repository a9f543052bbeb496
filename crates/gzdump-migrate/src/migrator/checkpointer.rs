//! Checkpointer stage: coalesce acknowledgements into durable progress.
//!
//! Runs as a single task owning the checkpoint document. Acknowledgements
//! feed the in-order commit watermark; the document is persisted at most
//! once per `checkpoint_interval`, plus one unconditional final persist when
//! the supervisor delivers the termination cause. Only a clean end-of-stream
//! termination marks the checkpoint completed.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::migrator::job::{CheckpointEvent, TerminationCause};
use crate::migrator::watermark::Watermark;

/// Cap on the post-termination drain of the event channel.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the checkpointer hands back to the supervisor.
#[derive(Debug)]
pub(crate) struct CheckpointerOutcome {
    /// Final checkpoint document, if checkpointing is enabled.
    pub checkpoint: Option<Checkpoint>,
    /// Final high-water mark, whether or not it was persisted.
    pub high_water_mark: Option<u64>,
}

pub(crate) struct Checkpointer {
    /// None when checkpointing is disabled; events are still consumed so
    /// the watermark (and final stats) stay meaningful.
    checkpoint: Option<Checkpoint>,
    path: PathBuf,
    interval: Duration,
    watermark: Watermark,
    last_persist: Option<Instant>,
}

impl Checkpointer {
    pub(crate) fn new(
        checkpoint: Option<Checkpoint>,
        path: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            checkpoint,
            path,
            interval,
            watermark: Watermark::new(),
            last_persist: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<CheckpointEvent>,
        mut term_rx: oneshot::Receiver<TerminationCause>,
    ) -> Result<CheckpointerOutcome> {
        debug!("checkpointer start");

        // Running: absorb events until the supervisor says otherwise.
        let cause = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        self.absorb(event);
                        self.maybe_persist()?;
                    }
                    None => {
                        // Every producer exited; only the terminal signal
                        // remains.
                        break (&mut term_rx).await.unwrap_or(TerminationCause::Fatal);
                    }
                },
                cause = &mut term_rx => {
                    break cause.unwrap_or(TerminationCause::Fatal);
                }
            }
        };

        // Draining: absorb whatever is already queued.
        debug!("checkpointer draining ({:?})", cause);
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match rx.try_recv() {
                Ok(event) => self.absorb(event),
                Err(_) => break,
            }
            if Instant::now() >= deadline {
                warn!("checkpoint drain timed out with events still queued");
                break;
            }
        }

        // Final persist, unconditionally.
        let clean = cause == TerminationCause::CleanEof;
        if let Some(cp) = self.checkpoint.as_mut() {
            if let Some(hw) = self.watermark.high_water() {
                cp.index_offset = cp.index_offset.max(hw);
            }
            if clean {
                cp.mark_completed();
            }
            cp.save(&self.path)?;
            info!(
                "final checkpoint persisted at offset {}{}",
                cp.index_offset,
                if clean { " (completed)" } else { "" }
            );
        }

        Ok(CheckpointerOutcome {
            checkpoint: self.checkpoint,
            high_water_mark: self.watermark.high_water(),
        })
    }

    fn absorb(&mut self, event: CheckpointEvent) {
        self.watermark.ack(event.seq, event.post_offset);
    }

    /// Persist if the watermark advanced and the interval elapsed.
    fn maybe_persist(&mut self) -> Result<()> {
        let Some(cp) = self.checkpoint.as_mut() else {
            return Ok(());
        };
        let Some(hw) = self.watermark.high_water() else {
            return Ok(());
        };
        if hw <= cp.index_offset {
            return Ok(());
        }
        if let Some(last) = self.last_persist {
            if last.elapsed() < self.interval {
                return Ok(());
            }
        }

        cp.index_offset = hw;
        cp.save(&self.path)?;
        self.last_persist = Some(Instant::now());
        debug!("checkpoint persisted at offset {}", hw);
        Ok(())
    }
}
