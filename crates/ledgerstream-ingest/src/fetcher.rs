//! RangeFetcher — resolves an explicit slot list at one commitment level,
//! retrying until every slot is either a real block or provably skipped.
//!
//! "Not yet available" is not the same as "absent": a slot near the live
//! edge may simply not have been produced yet, so misses are retried with
//! a pause, bounded by the confirmation-attempt budget. After everything
//! resolves, contradiction elimination cross-checks the parent links and
//! refetches the whole set if the node's answers disagree with each other.

use std::sync::Arc;

use tracing::{debug, warn};

use ledgerstream_core::{
    Block, Commitment, DetailFlags, IngestConfig, IngestError, LedgerRpcClient, SlotStatus,
};

/// Consecutive inconsistent elimination passes tolerated before giving up.
const MAX_INCONSISTENT_PASSES: u32 = 2;

/// Resolution state of one slot in a fetch pass or lookahead window.
#[derive(Debug, Clone)]
pub(crate) enum EntryState {
    Pending,
    Resolved(Block),
    Skipped,
}

#[derive(Debug, Clone)]
pub(crate) struct SlotEntry {
    pub slot: u64,
    pub state: EntryState,
}

impl SlotEntry {
    pub fn pending(slot: u64) -> Self {
        Self {
            slot,
            state: EntryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, EntryState::Pending)
    }
}

/// Fetches slot ranges with retry-until-consistent semantics.
pub struct RangeFetcher {
    client: Arc<dyn LedgerRpcClient>,
    config: IngestConfig,
}

impl RangeFetcher {
    pub fn new(client: Arc<dyn LedgerRpcClient>, config: IngestConfig) -> Self {
        Self { client, config }
    }

    /// Resolve every slot in `slots`, returning the real blocks in slot
    /// order (skipped slots dropped).
    pub async fn fetch(
        &self,
        commitment: Commitment,
        slots: &[u64],
        detail: &DetailFlags,
    ) -> Result<Vec<Block>, IngestError> {
        let mut entries: Vec<SlotEntry> = slots.iter().map(|&s| SlotEntry::pending(s)).collect();
        let mut inconsistent_passes = 0u32;

        loop {
            self.resolve_all(commitment, detail, &mut entries).await?;
            let Some(contradicted) = eliminate_contradictions(&mut entries) else {
                break;
            };
            inconsistent_passes += 1;
            if inconsistent_passes > MAX_INCONSISTENT_PASSES {
                return Err(IngestError::InconsistentSource {
                    slot: contradicted,
                    passes: inconsistent_passes,
                });
            }
            warn!(
                pass = inconsistent_passes,
                commitment = %commitment,
                "fetch pass contradicted itself, refetching the whole range"
            );
            for entry in &mut entries {
                entry.state = EntryState::Pending;
            }
        }

        Ok(entries
            .into_iter()
            .filter_map(|e| match e.state {
                EntryState::Resolved(block) => Some(block),
                _ => None,
            })
            .collect())
    }

    /// Repeatedly query the still-pending slots until none remain.
    async fn resolve_all(
        &self,
        commitment: Commitment,
        detail: &DetailFlags,
        entries: &mut [SlotEntry],
    ) -> Result<(), IngestError> {
        let mut attempts = 0u32;
        loop {
            let pending: Vec<u64> = entries
                .iter()
                .filter(|e| e.is_pending())
                .map(|e| e.slot)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            let results = self
                .client
                .resolve_blocks(commitment, &pending, detail)
                .await?;
            apply_results(entries, &pending, results)?;

            let remaining: Vec<u64> = entries
                .iter()
                .filter(|e| e.is_pending())
                .map(|e| e.slot)
                .collect();
            if remaining.is_empty() {
                return Ok(());
            }

            attempts += 1;
            if attempts >= self.config.max_confirmation_attempts {
                return Err(IngestError::UnresolvedSlot {
                    slot: remaining[0],
                    commitment,
                    attempts,
                });
            }
            debug!(
                remaining = remaining.len(),
                attempt = attempts,
                commitment = %commitment,
                "slots not yet available, pausing before the next pass"
            );
            tokio::time::sleep(self.config.confirmation_pause()).await;
        }
    }
}

/// Record one query pass into the entry list.
///
/// `queried` and `results` correspond element by element.
pub(crate) fn apply_results(
    entries: &mut [SlotEntry],
    queried: &[u64],
    results: Vec<SlotStatus>,
) -> Result<usize, IngestError> {
    if results.len() != queried.len() {
        return Err(IngestError::Rpc(format!(
            "asked for {} slots, node answered for {}",
            queried.len(),
            results.len()
        )));
    }
    let mut resolved = 0usize;
    for (&slot, status) in queried.iter().zip(results) {
        let state = match status {
            SlotStatus::Block(block) => EntryState::Resolved(block),
            SlotStatus::Skipped => EntryState::Skipped,
            SlotStatus::Missing => continue,
        };
        if let Some(entry) = entries.iter_mut().find(|e| e.slot == slot && e.is_pending()) {
            entry.state = state;
            resolved += 1;
        }
    }
    Ok(resolved)
}

/// Cross-check the parent links of every resolved block.
///
/// A block at slot `s` declaring parent slot `p` proves every slot strictly
/// between `p` and `s` is skipped on its chain. Pending entries in that span
/// are forced to skipped; a previously resolved block there means the node
/// contradicted itself, which invalidates the whole pass.
///
/// Returns the first slot whose previously resolved block was overturned,
/// if any.
pub(crate) fn eliminate_contradictions(entries: &mut [SlotEntry]) -> Option<u64> {
    let mut overturned = None;
    for i in 0..entries.len() {
        let (slot, parent_slot) = match &entries[i].state {
            EntryState::Resolved(b) => (b.slot, b.parent_slot),
            _ => continue,
        };
        for j in 0..i {
            if entries[j].slot <= parent_slot || entries[j].slot >= slot {
                continue;
            }
            match entries[j].state {
                EntryState::Resolved(_) => {
                    warn!(
                        slot = entries[j].slot,
                        child = slot,
                        parent = parent_slot,
                        "resolved block contradicted by a descendant's parent link"
                    );
                    entries[j].state = EntryState::Skipped;
                    overturned.get_or_insert(entries[j].slot);
                }
                EntryState::Pending => entries[j].state = EntryState::Skipped,
                EntryState::Skipped => {}
            }
        }
    }
    overturned
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ledgerstream_core::BlockRef;

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

    /// Answers one scripted map per `resolve_blocks` call; the last map
    /// repeats forever. Slots absent from a map come back `Missing`.
    struct ScriptClient {
        passes: Mutex<Vec<HashMap<u64, SlotStatus>>>,
    }

    impl ScriptClient {
        fn new(passes: Vec<HashMap<u64, SlotStatus>>) -> Self {
            Self {
                passes: Mutex::new(passes),
            }
        }
    }

    #[async_trait]
    impl LedgerRpcClient for ScriptClient {
        async fn resolve_blocks(
            &self,
            _commitment: Commitment,
            slots: &[u64],
            _detail: &DetailFlags,
        ) -> Result<Vec<SlotStatus>, IngestError> {
            let mut passes = self.passes.lock().unwrap();
            let map = if passes.len() > 1 {
                passes.remove(0)
            } else {
                passes[0].clone()
            };
            Ok(slots
                .iter()
                .map(|s| map.get(s).cloned().unwrap_or(SlotStatus::Missing))
                .collect())
        }

        async fn latest(&self, _commitment: Commitment) -> Result<BlockRef, IngestError> {
            Err(IngestError::Rpc("not scripted".into()))
        }
    }

    fn cfg() -> IngestConfig {
        IngestConfig::default()
            .max_confirmation_attempts(3)
            .confirmation_pause_ms(1)
    }

    fn pass(items: Vec<(u64, SlotStatus)>) -> HashMap<u64, SlotStatus> {
        items.into_iter().collect()
    }

    #[tokio::test]
    async fn resolves_blocks_and_drops_skipped() {
        let client = Arc::new(ScriptClient::new(vec![pass(vec![
            (1, SlotStatus::Block(b(1, 0))),
            (2, SlotStatus::Block(b(2, 1))),
            (3, SlotStatus::Skipped),
            (4, SlotStatus::Block(b(4, 2))),
        ])]));
        let fetcher = RangeFetcher::new(client, cfg());
        let blocks = fetcher
            .fetch(Commitment::Confirmed, &[1, 2, 3, 4], &DetailFlags::default())
            .await
            .unwrap();
        assert_eq!(
            blocks.iter().map(|b| b.slot).collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
    }

    #[tokio::test]
    async fn retries_not_yet_available_slots() {
        // slot 2 is missing on the first pass and appears on the second
        let client = Arc::new(ScriptClient::new(vec![
            pass(vec![(1, SlotStatus::Block(b(1, 0)))]),
            pass(vec![(2, SlotStatus::Block(b(2, 1)))]),
        ]));
        let fetcher = RangeFetcher::new(client, cfg());
        let blocks = fetcher
            .fetch(Commitment::Confirmed, &[1, 2], &DetailFlags::default())
            .await
            .unwrap();
        assert_eq!(blocks.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_slot() {
        let client = Arc::new(ScriptClient::new(vec![pass(vec![
            (1, SlotStatus::Block(b(1, 0))),
            (2, SlotStatus::Block(b(2, 1))),
        ])]));
        let fetcher = RangeFetcher::new(client, cfg());
        let err = fetcher
            .fetch(Commitment::Confirmed, &[1, 2, 3], &DetailFlags::default())
            .await
            .unwrap_err();
        match err {
            IngestError::UnresolvedSlot {
                slot,
                commitment,
                attempts,
            } => {
                assert_eq!(slot, 3);
                assert_eq!(commitment, Commitment::Confirmed);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected UnresolvedSlot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn contradicted_pass_is_refetched() {
        // First pass: 5 claims parent 2, yet 3 also resolved to a block.
        // Second pass: the node has settled — 3 is skipped.
        let client = Arc::new(ScriptClient::new(vec![
            pass(vec![
                (2, SlotStatus::Block(b(2, 1))),
                (3, SlotStatus::Block(b(3, 2))),
                (5, SlotStatus::Block(b(5, 2))),
            ]),
            pass(vec![
                (2, SlotStatus::Block(b(2, 1))),
                (3, SlotStatus::Skipped),
                (5, SlotStatus::Block(b(5, 2))),
            ]),
        ]));
        let fetcher = RangeFetcher::new(client, cfg());
        let blocks = fetcher
            .fetch(Commitment::Confirmed, &[2, 3, 5], &DetailFlags::default())
            .await
            .unwrap();
        assert_eq!(
            blocks.iter().map(|b| b.slot).collect::<Vec<_>>(),
            vec![2, 5]
        );
    }

    #[tokio::test]
    async fn persistent_contradiction_is_fatal() {
        let client = Arc::new(ScriptClient::new(vec![pass(vec![
            (2, SlotStatus::Block(b(2, 1))),
            (3, SlotStatus::Block(b(3, 2))),
            (5, SlotStatus::Block(b(5, 2))),
        ])]));
        let fetcher = RangeFetcher::new(client, cfg());
        let err = fetcher
            .fetch(Commitment::Confirmed, &[2, 3, 5], &DetailFlags::default())
            .await
            .unwrap_err();
        match err {
            IngestError::InconsistentSource { slot, passes } => {
                // names the slot that keeps being overturned, not the range start
                assert_eq!(slot, 3);
                assert_eq!(passes, 3);
            }
            other => panic!("expected InconsistentSource, got {other:?}"),
        }
    }

    #[test]
    fn elimination_skips_pending_without_overturning() {
        let mut entries = vec![
            SlotEntry {
                slot: 9,
                state: EntryState::Resolved(b(9, 8)),
            },
            SlotEntry::pending(10),
            SlotEntry::pending(11),
            SlotEntry {
                slot: 12,
                state: EntryState::Resolved(b(12, 9)),
            },
        ];
        assert!(eliminate_contradictions(&mut entries).is_none());
        assert!(matches!(entries[1].state, EntryState::Skipped));
        assert!(matches!(entries[2].state, EntryState::Skipped));
    }
}
