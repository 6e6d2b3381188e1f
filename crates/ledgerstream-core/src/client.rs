//! The query-interface seam to the transport layer.
//!
//! The pipeline never manages connections, wire-level retries, or request
//! batching itself — it consumes this trait and assumes the implementation
//! handles all of that.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::types::{Block, BlockRef, Commitment};

// ─── DetailFlags ──────────────────────────────────────────────────────────────

/// Per-block payload detail requested from the node.
///
/// Forwarded to the query interface untouched; the pipeline never interprets
/// the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailFlags {
    /// Request the richer per-block decode.
    pub extended_payload: bool,
    /// Include the reward section.
    pub rewards: bool,
}

impl DetailFlags {
    pub fn extended(mut self) -> Self {
        self.extended_payload = true;
        self
    }

    pub fn with_rewards(mut self) -> Self {
        self.rewards = true;
        self
    }
}

// ─── SlotStatus ───────────────────────────────────────────────────────────────

/// Per-slot resolution outcome from the node.
#[derive(Debug, Clone)]
pub enum SlotStatus {
    /// The slot holds this block.
    Block(Block),
    /// The slot provably never held a block.
    Skipped,
    /// The node cannot answer yet — the slot may still be produced.
    Missing,
}

// ─── LedgerRpcClient ──────────────────────────────────────────────────────────

/// Trait for querying blocks from a remote node.
///
/// Implementations own connection management and wire-level batching.
#[async_trait]
pub trait LedgerRpcClient: Send + Sync {
    /// Resolve each requested slot at the given commitment level.
    ///
    /// The returned vector corresponds to `slots` element by element.
    async fn resolve_blocks(
        &self,
        commitment: Commitment,
        slots: &[u64],
        detail: &DetailFlags,
    ) -> Result<Vec<SlotStatus>, IngestError>;

    /// The highest slot the node has reached at the given commitment level.
    async fn latest(&self, commitment: Commitment) -> Result<BlockRef, IngestError>;
}
