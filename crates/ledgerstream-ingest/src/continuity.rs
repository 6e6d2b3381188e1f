//! ContinuityFixer — verifies parent linkage across every batch boundary
//! and repairs violations by splicing in stronger-commitment re-fetches.
//!
//! The fixer walks each incoming batch against a tracked floor (the next
//! slot it still needs, plus the hash of the last block it emitted). A
//! block whose parent sits below the floor must link to the emitted chain
//! or it is a fork. A block whose parent sits at or above the floor points
//! at blocks the fixer has never seen — the suspect region is re-ingested
//! at finalized commitment and layered onto a correction stack, so the
//! output stays strictly increasing and chain-linked no matter how the
//! upstream misbehaves.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use ledgerstream_core::{
    Batch, Block, BlockRef, Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient,
    SlotRange,
};

use crate::ingest::Ingestor;
use crate::stream::{BatchSource, BoxBatchSource};

/// Corrections nested on corrections tolerated before the source is
/// declared too unstable to reconcile.
const MAX_CORRECTION_DEPTH: usize = 4;

/// Emitted block refs kept around as fork-resume candidates.
const RECENT_PARENTS: usize = 10;

// ─── TwoWayMerge ──────────────────────────────────────────────────────────────

/// Concatenation of a correction re-fetch (head) and the remainder of the
/// batch it replaced (tail).
///
/// The head runs until it lines up with the tail's earliest block, at
/// which point the head is dropped — releasing its in-flight requests —
/// and the tail is emitted instead of being re-fetched. A tail that falls
/// entirely behind the head's progress is redundant and is dropped.
struct TwoWayMerge {
    head: Option<BoxBatchSource>,
    tail: Option<Batch>,
}

impl TwoWayMerge {
    fn new(head: BoxBatchSource, tail: Batch) -> Self {
        Self {
            head: Some(head),
            tail: Some(tail),
        }
    }

    fn check_alignment(&mut self, emitted: &Batch) {
        let Some(last) = emitted.blocks.last() else {
            return;
        };
        let Some(tail) = &self.tail else {
            self.head = None;
            return;
        };
        match tail.blocks.first() {
            Some(first) => {
                let linked = first.parent_slot == last.slot && first.parent_hash == last.hash;
                let identical = first.slot == last.slot && first.hash == last.hash;
                if tail.blocks.last().map_or(true, |t| t.slot <= last.slot) {
                    // everything the tail holds has been re-delivered
                    self.tail = None;
                    self.head = None;
                } else if linked || identical {
                    self.head = None;
                }
            }
            None => {
                self.tail = None;
                self.head = None;
            }
        }
    }
}

#[async_trait]
impl BatchSource for TwoWayMerge {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        if let Some(head) = self.head.as_mut() {
            match head.next_batch().await? {
                Some(batch) => {
                    self.check_alignment(&batch);
                    return Ok(Some(batch));
                }
                None => self.head = None,
            }
        }
        Ok(self.tail.take())
    }
}

// ─── ContinuityFixer ──────────────────────────────────────────────────────────

/// Re-emits an upstream batch sequence as a strictly increasing,
/// chain-linked stream from a declared starting point, or fails with a
/// structured fork signal.
pub struct ContinuityFixer {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
    detail: DetailFlags,
    /// Active sub-sequences, topmost read from first.
    stack: Vec<BoxBatchSource>,
    /// Next slot not yet emitted.
    next_slot: u64,
    /// Hash of the last emitted block, or the caller's declared starting
    /// parent hash.
    parent_hash: Option<String>,
    /// Most recently emitted refs, kept as fork-resume candidates.
    recent: VecDeque<BlockRef>,
}

impl ContinuityFixer {
    pub fn new(
        client: Arc<dyn LedgerRpcClient>,
        config: IngestConfig,
        detail: DetailFlags,
        upstream: BoxBatchSource,
        start: u64,
        parent_hash: Option<String>,
    ) -> Self {
        Self {
            client,
            config,
            detail,
            stack: vec![upstream],
            next_slot: start,
            parent_hash,
            recent: VecDeque::new(),
        }
    }

    fn remember(&mut self, block: &Block) {
        self.next_slot = block.slot + 1;
        self.parent_hash = Some(block.hash.clone());
        if self.recent.len() == RECENT_PARENTS {
            self.recent.pop_front();
        }
        self.recent.push_back(block.to_ref());
    }

    /// Walk one batch against the floor. Returns the verified prefix; a
    /// suspect region pushes a correction onto the stack and truncates the
    /// batch there.
    fn verify(&mut self, batch: Batch) -> Result<Batch, IngestError> {
        let original_finalized = batch.finalized;
        let mut blocks = batch.blocks.into_iter();
        let mut accepted: Vec<Block> = Vec::new();

        while let Some(block) = blocks.next() {
            if block.slot < self.next_slot {
                continue; // replay of an already-emitted slot
            }
            if block.parent_slot >= self.next_slot {
                // the parent is a block this stream has never emitted
                return self.push_correction(block, blocks.collect(), accepted, original_finalized);
            }
            if let Some(expected) = &self.parent_hash {
                if block.parent_hash != *expected {
                    return Err(IngestError::ForkDetected {
                        expected_parent_hash: expected.clone(),
                        observed: block.to_ref(),
                        recent: self.recent.iter().cloned().collect(),
                    });
                }
            }
            self.remember(&block);
            accepted.push(block);
        }

        let finalized = original_finalized.filter(|f| f.slot < self.next_slot);
        Ok(Batch {
            blocks: accepted,
            finalized,
        })
    }

    fn push_correction(
        &mut self,
        suspect: Block,
        rest: Vec<Block>,
        accepted: Vec<Block>,
        original_finalized: Option<BlockRef>,
    ) -> Result<Batch, IngestError> {
        if self.stack.len() > MAX_CORRECTION_DEPTH {
            return Err(IngestError::TooUnstable {
                depth: self.stack.len(),
            });
        }
        warn!(
            from = self.next_slot,
            to = suspect.parent_slot,
            suspect = suspect.slot,
            depth = self.stack.len(),
            "linkage gap, re-ingesting the region at finalized commitment"
        );
        let gap = SlotRange::bounded(self.next_slot, suspect.parent_slot);
        let head: BoxBatchSource = Box::new(Ingestor::new(
            Arc::clone(&self.client),
            self.config.clone(),
            Commitment::Finalized,
            self.detail,
            gap,
        ));
        let tail_finalized = original_finalized.clone().filter(|f| f.slot >= self.next_slot);
        let mut tail_blocks = vec![suspect];
        tail_blocks.extend(rest);
        self.stack.push(Box::new(TwoWayMerge::new(
            head,
            Batch {
                blocks: tail_blocks,
                finalized: tail_finalized,
            },
        )));

        let finalized = original_finalized.filter(|f| f.slot < self.next_slot);
        Ok(Batch {
            blocks: accepted,
            finalized,
        })
    }
}

/// Truncate a batch at the first slot regression.
///
/// A stride retried mid-fetch can hand over a batch whose tail re-covers
/// slots its own prefix already holds; only the prefix is kept, and the
/// dropped remainder re-surfaces as a linkage gap and is re-fetched
/// cleanly. Gaps and fork evidence pass through untouched — the walk
/// handles those.
fn trim_overlap(batch: &mut Batch) {
    let mut keep = 1;
    while keep < batch.blocks.len() {
        if batch.blocks[keep].slot <= batch.blocks[keep - 1].slot {
            debug!(
                kept = keep,
                dropped = batch.blocks.len() - keep,
                "batch re-covers its own slots, truncating"
            );
            batch.blocks.truncate(keep);
            if let Some(last) = batch.blocks.last() {
                let last_slot = last.slot;
                batch.finalized = batch.finalized.take().filter(|f| f.slot <= last_slot);
            }
            return;
        }
        keep += 1;
    }
}

#[async_trait]
impl BatchSource for ContinuityFixer {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            match top.next_batch().await? {
                None => {
                    self.stack.pop();
                }
                Some(mut batch) => {
                    trim_overlap(&mut batch);
                    let verified = self.verify(batch)?;
                    if !verified.is_empty() {
                        return Ok(Some(verified));
                    }
                }
            }
        }
    }
}
