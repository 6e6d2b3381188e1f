//! FinalityTracker — forwards a continuity-fixed stream unchanged while a
//! side activity probes delivered blocks at finalized commitment and emits
//! watermark advances as out-of-band, block-less batches.
//!
//! The two activities share a bounded probe queue and one capacity-1
//! output channel, so a consumer that stops pulling stalls both of them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use ledgerstream_core::{
    Batch, BlockRef, Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient,
    SlotStatus,
};

use crate::stream::{BatchSource, BoxBatchSource};

/// Refs awaiting finalization; the oldest are silently dropped under
/// pressure rather than blocking the forwarder.
const PROBE_QUEUE_CAP: usize = 50;

/// Refs resolved per probe pass.
const PROBE_CHUNK: usize = 10;

struct ProbeState {
    queue: VecDeque<BlockRef>,
    watermark: Option<BlockRef>,
}

impl ProbeState {
    fn purge_finalized(&mut self) {
        if let Some(mark) = &self.watermark {
            let slot = mark.slot;
            self.queue.retain(|r| r.slot > slot);
        }
    }
}

/// Wraps a batch sequence and annotates it with an independently advancing
/// finalized watermark.
pub struct FinalityTracker {
    rx: mpsc::Receiver<Result<Batch, IngestError>>,
    forwarder: JoinHandle<()>,
    prober: JoinHandle<()>,
}

impl FinalityTracker {
    pub fn new(
        upstream: BoxBatchSource,
        client: Arc<dyn LedgerRpcClient>,
        config: IngestConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Result<Batch, IngestError>>(1);
        let state = Arc::new(Mutex::new(ProbeState {
            queue: VecDeque::new(),
            watermark: None,
        }));
        let wake = Arc::new(Notify::new());
        let done = Arc::new(AtomicBool::new(false));

        let forwarder = tokio::spawn(run_forwarder(
            upstream,
            Arc::clone(&state),
            Arc::clone(&wake),
            Arc::clone(&done),
            tx.clone(),
        ));
        let prober = tokio::spawn(run_prober(client, config, state, wake, done, tx));

        Self {
            rx,
            forwarder,
            prober,
        }
    }
}

#[async_trait]
impl BatchSource for FinalityTracker {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        match self.rx.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for FinalityTracker {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.prober.abort();
    }
}

// ─── Forwarding activity ──────────────────────────────────────────────────────

async fn run_forwarder(
    mut upstream: BoxBatchSource,
    state: Arc<Mutex<ProbeState>>,
    wake: Arc<Notify>,
    done: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<Batch, IngestError>>,
) {
    loop {
        match upstream.next_batch().await {
            Ok(Some(batch)) => {
                {
                    let mut state = state.lock().unwrap();
                    match &batch.finalized {
                        Some(mark) => {
                            // the batch certifies itself; nothing left to probe
                            let advances =
                                state.watermark.as_ref().map_or(true, |w| mark.slot > w.slot);
                            if advances {
                                state.watermark = Some(mark.clone());
                            }
                            state.queue.clear();
                        }
                        None => {
                            let floor = state.watermark.as_ref().map(|w| w.slot);
                            for block in &batch.blocks {
                                if floor.map_or(false, |f| block.slot <= f) {
                                    continue;
                                }
                                if state.queue.len() == PROBE_QUEUE_CAP {
                                    state.queue.pop_front();
                                }
                                state.queue.push_back(block.to_ref());
                            }
                        }
                    }
                }
                wake.notify_one();
                if tx.send(Ok(batch)).await.is_err() {
                    break; // consumer dropped the stream
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
    done.store(true, Ordering::Relaxed);
    wake.notify_one();
}

// ─── Probing activity ─────────────────────────────────────────────────────────

async fn run_prober(
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
    state: Arc<Mutex<ProbeState>>,
    wake: Arc<Notify>,
    done: Arc<AtomicBool>,
    tx: mpsc::Sender<Result<Batch, IngestError>>,
) {
    let detail = DetailFlags::default();
    loop {
        let chunk: Vec<BlockRef> = {
            let mut state = state.lock().unwrap();
            let take = state.queue.len().min(PROBE_CHUNK);
            state.queue.drain(..take).collect()
        };
        if chunk.is_empty() {
            if done.load(Ordering::Relaxed) {
                break;
            }
            wake.notified().await;
            continue;
        }

        let slots: Vec<u64> = chunk.iter().map(|r| r.slot).collect();
        trace!(candidates = slots.len(), "probing for finalization");
        let results = match client
            .resolve_blocks(Commitment::Finalized, &slots, &detail)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        // newest candidate whose finalized hash still matches wins; the
        // rest below it are implied, mismatches were superseded by a fork
        let mut advanced = None;
        for (candidate, status) in chunk.iter().zip(results.iter()).rev() {
            match status {
                SlotStatus::Block(block) if block.hash == candidate.hash => {
                    advanced = Some(candidate.clone());
                    break;
                }
                SlotStatus::Block(block) => {
                    debug!(
                        slot = candidate.slot,
                        seen = %candidate.hash,
                        finalized = %block.hash,
                        "delivered block superseded by a fork, discarding candidate"
                    );
                }
                SlotStatus::Skipped | SlotStatus::Missing => {}
            }
        }

        if let Some(mark) = advanced {
            let advances = {
                let mut state = state.lock().unwrap();
                let advances = state.watermark.as_ref().map_or(true, |w| mark.slot > w.slot);
                if advances {
                    state.watermark = Some(mark.clone());
                    state.purge_finalized();
                }
                advances
            };
            if advances {
                info!(watermark = %mark, "finalized watermark advanced");
                let update = Batch {
                    blocks: vec![],
                    finalized: Some(mark),
                };
                if tx.send(Ok(update)).await.is_err() {
                    break;
                }
            }
        }

        let more = { !state.lock().unwrap().queue.is_empty() };
        if more && !done.load(Ordering::Relaxed) {
            // let finalization catch up before spending more candidates
            tokio::time::sleep(config.head_poll_interval()).await;
        }
    }
}
