//! Ingestor — one ordered batch sequence for a commitment level and slot
//! range.
//!
//! Two phases, same shape as any backfill-then-live loop: while the range
//! sits more than one stride behind the tracked head, strides are fetched
//! with bounded concurrency and yielded strictly in range order; within one
//! stride of the head the ingestor hands over to the [`FrontierPoller`] and
//! follows the live edge.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use ledgerstream_core::{
    Batch, Block, BlockRef, Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient,
    SlotRange,
};

use crate::fetcher::RangeFetcher;
use crate::frontier::FrontierPoller;
use crate::stream::BatchSource;

// ─── HeadTracker ──────────────────────────────────────────────────────────────

/// Throttled, pre-fetching accessor for "how far has this commitment level
/// advanced".
///
/// The node is asked at most once per poll interval; once the cached value
/// goes stale the next one is requested eagerly on a spawned task while the
/// current one keeps being served.
struct HeadTracker {
    client: Arc<dyn LedgerRpcClient>,
    commitment: Commitment,
    config: IngestConfig,
    current: Option<BlockRef>,
    fetched_at: Option<Instant>,
    prefetch: Option<JoinHandle<Result<BlockRef, IngestError>>>,
}

impl HeadTracker {
    fn new(client: Arc<dyn LedgerRpcClient>, commitment: Commitment, config: IngestConfig) -> Self {
        Self {
            client,
            commitment,
            config,
            current: None,
            fetched_at: None,
            prefetch: None,
        }
    }

    async fn get(&mut self) -> Result<BlockRef, IngestError> {
        if self.prefetch.as_ref().map_or(false, |h| h.is_finished()) {
            if let Some(handle) = self.prefetch.take() {
                let head = handle
                    .await
                    .map_err(|e| IngestError::Rpc(format!("head poll task failed: {e}")))??;
                self.current = Some(head);
                self.fetched_at = Some(Instant::now());
            }
        }

        if let Some(head) = self.current.clone() {
            let stale = self
                .fetched_at
                .map_or(true, |t| t.elapsed() >= self.config.head_poll_interval());
            if stale && self.prefetch.is_none() {
                let client = Arc::clone(&self.client);
                let commitment = self.commitment;
                self.prefetch = Some(tokio::spawn(async move { client.latest(commitment).await }));
            }
            return Ok(head);
        }

        let head = self.client.latest(self.commitment).await?;
        self.current = Some(head.clone());
        self.fetched_at = Some(Instant::now());
        Ok(head)
    }
}

impl Drop for HeadTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.prefetch.take() {
            handle.abort();
        }
    }
}

// ─── Ingestor ─────────────────────────────────────────────────────────────────

type StrideFuture = BoxFuture<'static, Result<(Vec<Block>, bool), IngestError>>;

/// Produces ordered batches covering one slot range at one commitment level.
pub struct Ingestor {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
    commitment: Commitment,
    detail: DetailFlags,
    /// Next slot not yet handed to a stride or to the frontier.
    scheduled_until: u64,
    /// Inclusive upper bound; `None` follows the live edge.
    end: Option<u64>,
    head: HeadTracker,
    finalized_head: HeadTracker,
    inflight: FuturesOrdered<StrideFuture>,
    frontier: Option<FrontierPoller>,
    done: bool,
}

impl Ingestor {
    pub fn new(
        client: Arc<dyn LedgerRpcClient>,
        config: IngestConfig,
        commitment: Commitment,
        detail: DetailFlags,
        range: SlotRange,
    ) -> Self {
        let head = HeadTracker::new(Arc::clone(&client), commitment, config.clone());
        let finalized_head =
            HeadTracker::new(Arc::clone(&client), Commitment::Finalized, config.clone());
        Self {
            client,
            config,
            commitment,
            detail,
            scheduled_until: range.from,
            end: range.to,
            head,
            finalized_head,
            inflight: FuturesOrdered::new(),
            frontier: None,
            done: range.is_empty(),
        }
    }

    /// Keep up to `stride_concurrency` stride fetches outstanding, as long
    /// as the unscheduled remainder stays more than one stride behind the
    /// head.
    async fn schedule_strides(&mut self) -> Result<(), IngestError> {
        while self.inflight.len() < self.config.stride_concurrency {
            if let Some(end) = self.end {
                if self.scheduled_until > end {
                    return Ok(());
                }
            }
            let head = self.head.get().await?;
            if head.slot.saturating_sub(self.scheduled_until) <= self.config.stride_size as u64 {
                return Ok(());
            }

            let mut stride_end = self.scheduled_until + self.config.stride_size as u64 - 1;
            if let Some(end) = self.end {
                stride_end = stride_end.min(end);
            }
            let finalized = self.finalized_head.get().await?;
            let is_final =
                self.commitment == Commitment::Finalized || stride_end <= finalized.slot;
            // a stride provably behind the finalized boundary can skip the
            // weaker commitment level entirely
            let commitment = if is_final {
                Commitment::Finalized
            } else {
                self.commitment
            };

            let slots: Vec<u64> = (self.scheduled_until..=stride_end).collect();
            debug!(
                from = self.scheduled_until,
                to = stride_end,
                commitment = %commitment,
                "scheduling stride"
            );
            let fetcher = RangeFetcher::new(Arc::clone(&self.client), self.config.clone());
            let detail = self.detail;
            let fut: StrideFuture = async move {
                let blocks = fetcher.fetch(commitment, &slots, &detail).await?;
                Ok((blocks, is_final))
            }
            .boxed();
            self.inflight.push_back(fut);
            self.scheduled_until = stride_end + 1;
        }
        Ok(())
    }

    async fn frontier_batch(&mut self, mut blocks: Vec<Block>) -> Result<Option<Batch>, IngestError> {
        if let Some(end) = self.end {
            blocks.retain(|b| b.slot <= end);
        }
        let cursor = self.frontier.as_ref().map_or(0, |fp| fp.cursor());
        if self.end.map_or(false, |end| cursor > end) {
            self.done = true;
        }
        let Some(last) = blocks.last() else {
            return Ok(None);
        };
        let finalized = if self.commitment == Commitment::Finalized {
            Some(last.to_ref())
        } else {
            let finalized_head = self.finalized_head.get().await?;
            (last.slot <= finalized_head.slot).then(|| last.to_ref())
        };
        Ok(Some(Batch { blocks, finalized }))
    }
}

#[async_trait]
impl BatchSource for Ingestor {
    async fn next_batch(&mut self) -> Result<Option<Batch>, IngestError> {
        loop {
            if self.done {
                return Ok(None);
            }

            if self.frontier.is_some() {
                let blocks = match self.frontier.as_mut() {
                    Some(fp) => fp.advance().await?,
                    None => Vec::new(),
                };
                match self.frontier_batch(blocks).await? {
                    Some(batch) => return Ok(Some(batch)),
                    None if self.done => return Ok(None),
                    None => continue,
                }
            }

            self.schedule_strides().await?;

            if let Some(result) = self.inflight.next().await {
                let (blocks, is_final) = result?;
                let Some(last) = blocks.last() else {
                    continue; // every slot in the stride was skipped
                };
                let finalized = is_final.then(|| last.to_ref());
                return Ok(Some(Batch { blocks, finalized }));
            }

            // nothing in flight and nothing schedulable in bulk
            if let Some(end) = self.end {
                if self.scheduled_until > end {
                    self.done = true;
                    return Ok(None);
                }
            }
            info!(
                cursor = self.scheduled_until,
                commitment = %self.commitment,
                "within one stride of the head, switching to the frontier poller"
            );
            self.frontier = Some(FrontierPoller::new(
                Arc::clone(&self.client),
                self.config.clone(),
                self.commitment,
                self.detail,
                self.scheduled_until,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use ledgerstream_core::SlotStatus;

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

    /// A fixed chain with independent confirmed/finalized heads.
    struct ChainClient {
        chain: BTreeMap<u64, Block>,
        confirmed_head: u64,
        finalized_head: u64,
        latest_calls: Mutex<u32>,
    }

    impl ChainClient {
        fn linear(up_to: u64, confirmed_head: u64, finalized_head: u64) -> Self {
            let chain = (0..=up_to)
                .map(|s| (s, b(s, s.saturating_sub(1))))
                .collect();
            Self {
                chain,
                confirmed_head,
                finalized_head,
                latest_calls: Mutex::new(0),
            }
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
            *self.latest_calls.lock().unwrap() += 1;
            let head = self.head(commitment);
            Ok(BlockRef {
                slot: head,
                hash: format!("h{head}"),
            })
        }
    }

    fn cfg() -> IngestConfig {
        IngestConfig::default()
            .stride_size(10)
            .stride_concurrency(3)
            .max_confirmation_attempts(5)
            .confirmation_pause_ms(1)
    }

    async fn collect_blocks(source: &mut Ingestor) -> (Vec<u64>, Vec<Option<u64>>) {
        let mut slots = Vec::new();
        let mut finals = Vec::new();
        while let Some(batch) = source.next_batch().await.unwrap() {
            slots.extend(batch.blocks.iter().map(|b| b.slot));
            finals.push(batch.finalized.map(|f| f.slot));
        }
        (slots, finals)
    }

    #[tokio::test]
    async fn bulk_strides_yield_in_range_order() {
        let client = Arc::new(ChainClient::linear(100, 100, 40));
        let mut ingestor = Ingestor::new(
            client,
            cfg(),
            Commitment::Confirmed,
            DetailFlags::default(),
            SlotRange::bounded(0, 59),
        );
        let (slots, finals) = collect_blocks(&mut ingestor).await;
        assert_eq!(slots, (0..=59).collect::<Vec<_>>());
        // strides ending at or below the finalized head (40) carry the ref
        assert_eq!(finals[0], Some(9));
        assert_eq!(finals[3], Some(39));
        assert_eq!(finals[4], None);
    }

    #[tokio::test]
    async fn switches_to_frontier_near_the_head() {
        // head is 15 with stride size 10: slots past 5 go through the poller
        let client = Arc::new(ChainClient::linear(15, 15, 15));
        let mut ingestor = Ingestor::new(
            client,
            cfg(),
            Commitment::Confirmed,
            DetailFlags::default(),
            SlotRange::bounded(0, 15),
        );
        let (slots, _) = collect_blocks(&mut ingestor).await;
        assert_eq!(slots, (0..=15).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn finalized_commitment_stamps_every_batch() {
        let client = Arc::new(ChainClient::linear(30, 30, 30));
        let mut ingestor = Ingestor::new(
            client,
            cfg(),
            Commitment::Finalized,
            DetailFlags::default(),
            SlotRange::bounded(0, 30),
        );
        let (slots, finals) = collect_blocks(&mut ingestor).await;
        assert_eq!(slots, (0..=30).collect::<Vec<_>>());
        assert!(finals.iter().all(|f| f.is_some()));
    }

    #[tokio::test]
    async fn bounded_range_trims_trailing_blocks() {
        let client = Arc::new(ChainClient::linear(20, 12, 12));
        let mut ingestor = Ingestor::new(
            client,
            cfg(),
            Commitment::Confirmed,
            DetailFlags::default(),
            SlotRange::bounded(8, 10),
        );
        let (slots, _) = collect_blocks(&mut ingestor).await;
        assert_eq!(slots, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn empty_range_ends_immediately() {
        let client = Arc::new(ChainClient::linear(20, 20, 20));
        let mut ingestor = Ingestor::new(
            client,
            cfg(),
            Commitment::Confirmed,
            DetailFlags::default(),
            SlotRange::bounded(10, 9),
        );
        assert!(ingestor.next_batch().await.unwrap().is_none());
    }
}
