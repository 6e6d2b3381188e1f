//! ledgerstream-ingest — the continuity-repairing ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! LedgerSource (facade, gap filling)
//!     └── Ingestor              (ordered batches for one commitment + range)
//!             ├── RangeFetcher  (strided bulk fetching, retry-until-consistent)
//!             └── FrontierPoller (live-edge lookahead window)
//!         → ContinuityFixer     (linkage verification, fork correction stack)
//!         → FinalityTracker     (finalized-watermark side channel)
//! ```
//!
//! Every stage is a pull-based [`BatchSource`]; a slow consumer stalls the
//! producers, and dropping a stream cancels every nested in-flight request.

pub mod continuity;
pub mod fetcher;
pub mod finality;
pub mod frontier;
pub mod ingest;
pub mod source;
pub mod stream;

pub use continuity::ContinuityFixer;
pub use fetcher::RangeFetcher;
pub use finality::FinalityTracker;
pub use frontier::FrontierPoller;
pub use ingest::Ingestor;
pub use source::LedgerSource;
pub use stream::{BatchSource, BoxBatchSource};
