//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::types::{BlockRef, Commitment};

/// Errors that can terminate an ingestion stream.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("slot {slot} did not resolve at {commitment} commitment after {attempts} attempts")]
    UnresolvedSlot {
        slot: u64,
        commitment: Commitment,
        attempts: u32,
    },

    #[error("source contradicted itself around slot {slot} for {passes} consecutive passes")]
    InconsistentSource { slot: u64, passes: u32 },

    #[error("fork detected at {observed}: expected parent hash {expected_parent_hash}")]
    ForkDetected {
        expected_parent_hash: String,
        observed: BlockRef,
        /// Most recently delivered blocks — candidate resume points.
        recent: Vec<BlockRef>,
    },

    #[error("source too unstable: correction depth {depth} exceeded the limit")]
    TooUnstable { depth: usize },

    #[error("node is too far behind the requested starting point (slot {slot}, {attempts} gap-fill attempts)")]
    NodeBehind { slot: u64, attempts: u32 },
}

impl IngestError {
    /// Returns `true` if the error is a fork signal (the caller can resume
    /// with a range starting at or before the last safely-observed slot).
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::ForkDetected { .. })
    }
}
