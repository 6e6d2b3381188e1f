//! FrontierPoller — a sliding lookahead window over the live edge of the
//! chain.
//!
//! The window holds `stride_size` slots starting at a cursor. Each call to
//! [`FrontierPoller::advance`] resolves what it can, runs the same
//! contradiction elimination as the bulk fetcher, and emits the verified
//! prefix of the window — everything before the first slot the node has
//! not answered for yet. Emitted slots leave the window and the cursor
//! moves past them; unresolved slots stay resident for the next call.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use ledgerstream_core::{
    Block, Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient,
};

use crate::fetcher::{apply_results, eliminate_contradictions, EntryState, SlotEntry};

/// Polls the moving frontier of the chain at one commitment level.
pub struct FrontierPoller {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
    commitment: Commitment,
    detail: DetailFlags,
    window: VecDeque<SlotEntry>,
    /// Next slot to append when padding the window tail.
    next_slot: u64,
}

impl FrontierPoller {
    pub fn new(
        client: Arc<dyn LedgerRpcClient>,
        config: IngestConfig,
        commitment: Commitment,
        detail: DetailFlags,
        start: u64,
    ) -> Self {
        Self {
            client,
            config,
            commitment,
            detail,
            window: VecDeque::new(),
            next_slot: start,
        }
    }

    /// The first slot not yet emitted.
    pub fn cursor(&self) -> u64 {
        self.window.front().map_or(self.next_slot, |e| e.slot)
    }

    /// Poll until a non-empty verified prefix is ready and return its
    /// blocks.
    ///
    /// Waiting is how the poller follows the live edge: when the window's
    /// head slot is still unanswered it pauses and re-polls. The attempt
    /// budget resets whenever a pass resolves anything, so only a head
    /// slot the node never answers for exhausts it.
    pub async fn advance(&mut self) -> Result<Vec<Block>, IngestError> {
        let mut attempts = 0u32;
        loop {
            self.pad_window();
            let progressed = self.poll_pending().await?;
            eliminate_contradictions(self.window.make_contiguous());

            let ready = self
                .window
                .iter()
                .take_while(|e| !e.is_pending())
                .count();
            if ready > 0 {
                let mut blocks = Vec::new();
                for _ in 0..ready {
                    if let Some(entry) = self.window.pop_front() {
                        if let EntryState::Resolved(block) = entry.state {
                            blocks.push(block);
                        }
                    }
                }
                if !blocks.is_empty() {
                    return Ok(blocks);
                }
                // the whole prefix was skipped slots — keep going
                continue;
            }

            if progressed {
                attempts = 0;
            }
            attempts += 1;
            if attempts >= self.config.max_confirmation_attempts {
                return Err(IngestError::UnresolvedSlot {
                    slot: self.cursor(),
                    commitment: self.commitment,
                    attempts,
                });
            }
            trace!(
                cursor = self.cursor(),
                attempt = attempts,
                "frontier head not yet available, pausing"
            );
            tokio::time::sleep(self.config.confirmation_pause()).await;
        }
    }

    /// Top the window up to `stride_size` slots.
    fn pad_window(&mut self) {
        while self.window.len() < self.config.stride_size {
            self.window.push_back(SlotEntry::pending(self.next_slot));
            self.next_slot += 1;
        }
    }

    /// One query pass over the still-pending window slots.
    ///
    /// Returns `true` if anything resolved.
    async fn poll_pending(&mut self) -> Result<bool, IngestError> {
        let pending: Vec<u64> = self
            .window
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.slot)
            .collect();
        if pending.is_empty() {
            return Ok(false);
        }
        let results = self
            .client
            .resolve_blocks(self.commitment, &pending, &self.detail)
            .await?;
        let resolved = apply_results(self.window.make_contiguous(), &pending, results)?;
        Ok(resolved > 0)
    }
}
