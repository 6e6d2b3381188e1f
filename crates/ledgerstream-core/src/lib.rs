//! ledgerstream-core — shared foundation for the continuity-repairing
//! block ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! LedgerSource → Ingestor ──→ ContinuityFixer ──→ FinalityTracker
//!                   ├── RangeFetcher   (strided bulk fetching)
//!                   └── FrontierPoller (live-edge window)
//! ```
//!
//! This crate holds what every stage shares: the block data model, the
//! [`LedgerRpcClient`] seam to the transport layer, the error taxonomy,
//! and the tunable configuration.

pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::{DetailFlags, LedgerRpcClient, SlotStatus};
pub use config::IngestConfig;
pub use error::IngestError;
pub use types::{Batch, Block, BlockRef, Commitment, SlotRange};
