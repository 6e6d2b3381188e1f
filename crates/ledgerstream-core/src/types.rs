//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── Commitment ───────────────────────────────────────────────────────────────

/// How irreversible the node currently believes data at a slot to be.
///
/// Ordered: `Finalized` is the strongest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    /// Voted on by a supermajority, but still revertible by a fork.
    Confirmed,
    /// Certified never to change.
    Finalized,
}

impl std::fmt::Display for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "confirmed"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A single block as delivered by the pipeline.
///
/// `payload` is opaque to the pipeline — decoding it is the downstream
/// transform's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Slot this block occupies.
    pub slot: u64,
    /// Slot of the nearest preceding non-empty slot on this block's chain.
    pub parent_slot: u64,
    /// Block hash.
    pub hash: String,
    /// Hash of the parent block.
    pub parent_hash: String,
    /// Raw block content, forwarded untouched.
    pub payload: serde_json::Value,
}

impl Block {
    /// Returns `true` if `self` is the direct chain child of `parent`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.parent_slot == parent.slot && self.parent_hash == parent.hash
    }

    /// Lightweight pointer to this block.
    pub fn to_ref(&self) -> BlockRef {
        BlockRef {
            slot: self.slot,
            hash: self.hash.clone(),
        }
    }
}

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// A lightweight block pointer — used for heads, the finalized watermark,
/// and fork evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub slot: u64,
    pub hash: String,
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {} ({})", self.slot, self.hash)
    }
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// One unit of pipeline output: blocks strictly increasing by slot and
/// chain-linked within the batch.
///
/// `finalized` is present only when every block up to and including it is
/// certified irreversible. A batch may carry `finalized` with no blocks at
/// all — an out-of-band watermark advance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batch {
    pub blocks: Vec<Block>,
    pub finalized: Option<BlockRef>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.finalized.is_none()
    }
}

// ─── SlotRange ────────────────────────────────────────────────────────────────

/// A slot range. `to` is inclusive; `None` means "follow the live edge".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub from: u64,
    pub to: Option<u64>,
}

impl SlotRange {
    pub fn new(from: u64, to: Option<u64>) -> Self {
        Self { from, to }
    }

    /// Bounded range `from..=to`.
    pub fn bounded(from: u64, to: u64) -> Self {
        Self { from, to: Some(to) }
    }

    /// Unbounded range following the live edge.
    pub fn open(from: u64) -> Self {
        Self { from, to: None }
    }

    /// Returns `true` if `slot` falls inside the range.
    pub fn contains(&self, slot: u64) -> bool {
        slot >= self.from && self.to.map_or(true, |to| slot <= to)
    }

    /// Returns `true` if the range holds no slots at all.
    pub fn is_empty(&self) -> bool {
        self.to.map_or(false, |to| to < self.from)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
