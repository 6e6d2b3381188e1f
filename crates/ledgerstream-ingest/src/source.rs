//! LedgerSource — the public entry point that wires the pipeline together.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use ledgerstream_core::{
    Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient, SlotRange,
};
use ledgerstream_core::{Batch, BlockRef};

use crate::continuity::ContinuityFixer;
use crate::finality::FinalityTracker;
use crate::ingest::Ingestor;
use crate::stream::{BatchSource, BoxBatchSource};

/// Polls of the finalized head tolerated while waiting for it to cover a
/// gap between requested sub-ranges.
const MAX_GAP_WAIT_ATTEMPTS: u32 = 10;

/// Public handle over one node connection: head queries and the streaming
/// operations.
pub struct LedgerSource {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
}

impl LedgerSource {
    pub fn new(client: Arc<dyn LedgerRpcClient>, config: IngestConfig) -> Self {
        Self { client, config }
    }

    /// Latest confirmed block the node knows of.
    pub async fn get_head(&self) -> Result<BlockRef, IngestError> {
        self.client.latest(Commitment::Confirmed).await
    }

    /// Latest finalized block the node knows of.
    pub async fn get_finalized_head(&self) -> Result<BlockRef, IngestError> {
        self.client.latest(Commitment::Finalized).await
    }

    /// Ordered, chain-continuous stream of confirmed blocks over `range`,
    /// annotated with finalized watermark advances.
    ///
    /// `starting_parent_hash` declares what the caller believes precedes
    /// `range.from`; a disagreeing chain raises
    /// [`IngestError::ForkDetected`] so the caller can pick an earlier
    /// starting point.
    pub fn get_stream(
        &self,
        range: SlotRange,
        detail: DetailFlags,
        starting_parent_hash: Option<String>,
    ) -> BoxBatchSource {
        self.get_stream_set(vec![range], detail, starting_parent_hash)
    }

    /// Like [`get_stream`](Self::get_stream) over several disjoint
    /// sub-ranges: the gaps between them are re-ingested at finalized
    /// commitment so the output is one continuous chain.
    pub fn get_stream_set(
        &self,
        ranges: Vec<SlotRange>,
        detail: DetailFlags,
        starting_parent_hash: Option<String>,
    ) -> BoxBatchSource {
        let mut ranges: Vec<SlotRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_by_key(|r| r.from);
        let start = ranges.first().map_or(0, |r| r.from);
        info!(
            start,
            segments = ranges.len(),
            "opening confirmed stream"
        );

        let spliced = SpliceSource::new(
            Arc::clone(&self.client),
            self.config.clone(),
            detail,
            ranges,
        );
        let fixed = ContinuityFixer::new(
            Arc::clone(&self.client),
            self.config.clone(),
            detail,
            Box::new(spliced),
            start,
            starting_parent_hash,
        );
        Box::new(FinalityTracker::new(
            Box::new(fixed),
            Arc::clone(&self.client),
            self.config.clone(),
        ))
    }

    /// Ordered stream of finalized blocks over `range`; every batch
    /// carries a finalized ref, so no tracker is layered on.
    pub fn get_finalized_stream(&self, range: SlotRange, detail: DetailFlags) -> BoxBatchSource {
        info!(from = range.from, to = ?range.to, "opening finalized stream");
        let ingestor = Ingestor::new(
            Arc::clone(&self.client),
            self.config.clone(),
            Commitment::Finalized,
            detail,
            range,
        );
        Box::new(ContinuityFixer::new(
            Arc::clone(&self.client),
            self.config.clone(),
            detail,
            Box::new(ingestor),
            range.from,
            None,
        ))
    }
}

// ─── SpliceSource ─────────────────────────────────────────────────────────────

enum Segment {
    /// A sub-range the caller asked for, served at confirmed commitment.
    Requested(SlotRange),
    /// A gap between requested sub-ranges, filled at finalized commitment.
    Gap(SlotRange),
}

/// Runs the requested sub-ranges back to back, filling the gaps between
/// them so downstream sees one continuous chain.
struct SpliceSource {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
    detail: DetailFlags,
    segments: VecDeque<Segment>,
    current: Option<Ingestor>,
}

impl SpliceSource {
    fn new(
        client: Arc<dyn LedgerRpcClient>,
        config: IngestConfig,
        detail: DetailFlags,
        ranges: Vec<SlotRange>,
    ) -> Self {
        let mut segments = VecDeque::new();
        let mut covered_to: Option<u64> = None;
        for range in ranges {
            if let Some(prev_to) = covered_to {
                if prev_to + 1 < range.from {
                    segments.push_back(Segment::Gap(SlotRange::bounded(prev_to + 1, range.from - 1)));
                }
            }
            segments.push_back(Segment::Requested(range));
            match range.to {
                Some(to) => covered_to = Some(to),
                // an open range follows the live edge; later sub-ranges
                // can never be reached
                None => break,
            }
        }
        Self {
            client,
            config,
            detail,
            segments,
            current: None,
        }
    }

    /// Block until the node's finalized view covers the gap.
    async fn wait_for_finalized(&mut self, gap: SlotRange) -> Result<(), IngestError> {
        let Some(to) = gap.to else {
            return Ok(());
        };
        let mut attempts = 0u32;
        loop {
            let head = self.client.latest(Commitment::Finalized).await?;
            if head.slot >= to {
                return Ok(());
            }
            attempts += 1;
            if attempts >= MAX_GAP_WAIT_ATTEMPTS {
                return Err(IngestError::NodeBehind {
                    slot: gap.from,
                    attempts,
                });
            }
            debug!(
                finalized = head.slot,
                needed = to,
                attempt = attempts,
                "finalized head does not cover the gap yet"
            );
            tokio::time::sleep(self.config.head_poll_interval()).await;
        }
    }
}

#[async_trait]
impl BatchSource for SpliceSource {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next_batch().await? {
                    Some(batch) => return Ok(Some(batch)),
                    None => self.current = None,
                }
            }
            let Some(segment) = self.segments.pop_front() else {
                return Ok(None);
            };
            let (range, commitment) = match segment {
                Segment::Requested(range) => (range, Commitment::Confirmed),
                Segment::Gap(range) => {
                    debug!(from = range.from, to = ?range.to, "filling gap between sub-ranges");
                    self.wait_for_finalized(range).await?;
                    (range, Commitment::Finalized)
                }
            };
            self.current = Some(Ingestor::new(
                Arc::clone(&self.client),
                self.config.clone(),
                commitment,
                self.detail,
                range,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ledgerstream_core::{Block, SlotStatus};

    use super::*;

    fn b(slot: u64, parent_slot: u64) -> Block {
        Block {
            slot,
            parent_slot,
            hash: format!("h{slot}"),
            parent_hash: format!("h{parent_slot}"),
            payload: serde_json::Value::Null,
        }
    }

    struct ChainClient {
        chain: BTreeMap<u64, Block>,
        confirmed_head: u64,
        finalized_head: u64,
    }

    impl ChainClient {
        fn linear(up_to: u64, confirmed_head: u64, finalized_head: u64) -> Arc<Self> {
            Arc::new(Self {
                chain: (0..=up_to)
                    .map(|s| (s, b(s, s.saturating_sub(1))))
                    .collect(),
                confirmed_head,
                finalized_head,
            })
        }

        fn head(&self, commitment: Commitment) -> u64 {
            match commitment {
                Commitment::Confirmed => self.confirmed_head,
                Commitment::Finalized => self.finalized_head,
            }
        }
    }

    #[async_trait]
    impl LedgerRpcClient for ChainClient {
        async fn resolve_blocks(
            &self,
            commitment: Commitment,
            slots: &[u64],
            _detail: &DetailFlags,
        ) -> Result<Vec<SlotStatus>, IngestError> {
            let head = self.head(commitment);
            Ok(slots
                .iter()
                .map(|s| {
                    if *s > head {
                        SlotStatus::Missing
                    } else {
                        match self.chain.get(s) {
                            Some(block) => SlotStatus::Block(block.clone()),
                            None => SlotStatus::Skipped,
                        }
                    }
                })
                .collect())
        }

        async fn latest(&self, commitment: Commitment) -> Result<BlockRef, IngestError> {
            let head = self.head(commitment);
            Ok(BlockRef {
                slot: head,
                hash: format!("h{head}"),
            })
        }
    }

    fn cfg() -> IngestConfig {
        IngestConfig::default()
            .stride_size(4)
            .stride_concurrency(2)
            .max_confirmation_attempts(3)
            .confirmation_pause_ms(1)
            .head_poll_interval_ms(1)
    }

    #[tokio::test]
    async fn head_queries_pass_through() {
        let source = LedgerSource::new(ChainClient::linear(100, 90, 60), cfg());
        assert_eq!(source.get_head().await.unwrap().slot, 90);
        assert_eq!(source.get_finalized_head().await.unwrap().slot, 60);
    }

    #[tokio::test]
    async fn stream_set_fills_the_gap() {
        let source = LedgerSource::new(ChainClient::linear(100, 100, 100), cfg());
        let mut stream = source.get_stream_set(
            vec![SlotRange::bounded(0, 2), SlotRange::bounded(6, 8)],
            DetailFlags::default(),
            None,
        );
        let mut slots = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            slots.extend(batch.blocks.iter().map(|b| b.slot));
        }
        assert_eq!(slots, (0..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn lagging_node_fails_the_gap_fill() {
        // the finalized head never reaches the gap's end
        let source = LedgerSource::new(ChainClient::linear(100, 100, 2), cfg());
        let mut stream = source.get_stream_set(
            vec![SlotRange::bounded(0, 1), SlotRange::bounded(8, 9)],
            DetailFlags::default(),
            None,
        );
        let err = loop {
            match stream.next_batch().await {
                Ok(Some(_)) => {}
                Ok(None) => panic!("stream ended without the gap-fill error"),
                Err(e) => break e,
            }
        };
        match err {
            IngestError::NodeBehind { slot, attempts } => {
                assert_eq!(slot, 2);
                assert_eq!(attempts, MAX_GAP_WAIT_ATTEMPTS);
            }
            other => panic!("expected NodeBehind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalized_stream_marks_every_batch() {
        let source = LedgerSource::new(ChainClient::linear(50, 50, 50), cfg());
        let mut stream = source.get_finalized_stream(SlotRange::bounded(0, 20), DetailFlags::default());
        let mut slots = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            assert!(batch.finalized.is_some());
            slots.extend(batch.blocks.iter().map(|b| b.slot));
        }
        assert_eq!(slots, (0..=20).collect::<Vec<_>>());
    }
}
