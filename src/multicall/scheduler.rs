//! Batch scheduler
//!
//! On every new block height the scheduler picks the registered calls that are
//! due, marks them in flight, and cuts them into batches no larger than the
//! aggregator can take. Responses are folded back into the cache afterwards;
//! nothing in here awaits.

use eyre::Result;
use std::collections::HashMap;

use super::aggregator::CallOutcome;
use super::cache::{CacheEntry, ResultCache};
use super::call::Call;
use super::listeners::ListenerRegistry;
use super::ChainId;

/// Calls sent together in one aggregated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub chain_id: ChainId,
    pub block: u64,
    pub calls: Vec<Call>,
}

/// What happened when a batch response was applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Results written to the cache
    pub updated: usize,
    /// Calls marked as failed
    pub failed: usize,
    /// Writes dropped because a newer block was already cached
    pub superseded: usize,
}

#[derive(Debug)]
pub struct BatchScheduler {
    max_batch_size: usize,
    latest_block: HashMap<ChainId, u64>,
}

impl BatchScheduler {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            latest_block: HashMap::new(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn latest_block(&self, chain_id: ChainId) -> Option<u64> {
        self.latest_block.get(&chain_id).copied()
    }

    /// Record a block height. Returns `false` if it does not advance the chain.
    pub fn observe_block(&mut self, chain_id: ChainId, block: u64) -> bool {
        match self.latest_block.get(&chain_id) {
            Some(&latest) if latest >= block => false,
            _ => {
                self.latest_block.insert(chain_id, block);
                true
            }
        }
    }

    /// Registered calls that need a refresh at `block`, in registration order
    pub fn due_calls(
        &self,
        listeners: &ListenerRegistry,
        cache: &ResultCache,
        chain_id: ChainId,
        block: u64,
    ) -> Vec<Call> {
        listeners
            .active_calls(chain_id)
            .into_iter()
            .filter(|(call, cadence)| is_due(cache.entry(chain_id, call), *cadence, block))
            .map(|(call, _)| call)
            .collect()
    }

    /// Select due calls, mark them in flight at `block` and split them into batches
    pub fn plan(
        &self,
        listeners: &ListenerRegistry,
        cache: &mut ResultCache,
        chain_id: ChainId,
        block: u64,
    ) -> Vec<Batch> {
        let due = self.due_calls(listeners, cache, chain_id, block);
        for call in &due {
            cache.mark_fetching(chain_id, call, block);
        }

        due.chunks(self.max_batch_size)
            .map(|chunk| Batch { chain_id, block, calls: chunk.to_vec() })
            .collect()
    }
}

/// Whether a call with the given cache entry must be fetched at `block`
fn is_due(entry: Option<&CacheEntry>, cadence: u64, block: u64) -> bool {
    let Some(entry) = entry else {
        return true;
    };

    let fresh = entry
        .block_number
        .map_or(false, |cached| cached.saturating_add(cadence) > block);
    if fresh {
        return false;
    }

    // A request recent enough to satisfy the cadence is already on its way
    let in_flight = entry
        .fetching_block_number
        .map_or(false, |fetching| fetching.saturating_add(cadence) > block);
    !in_flight
}

/// Fold an aggregator response for `batch` into the cache.
///
/// A whole-batch failure, or a response with the wrong number of outcomes,
/// marks every call in the batch as failed.
pub fn apply_response(
    cache: &mut ResultCache,
    batch: &Batch,
    response: &Result<Vec<CallOutcome>>,
) -> BatchReport {
    let mut report = BatchReport::default();

    let outcomes = match response {
        Ok(outcomes) if outcomes.len() == batch.calls.len() => Some(outcomes),
        _ => None,
    };

    for (i, call) in batch.calls.iter().enumerate() {
        let applied = match outcomes.map(|o| &o[i]) {
            Some(CallOutcome::Success(data)) => {
                let written = cache.apply_result(batch.chain_id, call, batch.block, data.clone());
                if written {
                    report.updated += 1;
                }
                written
            }
            Some(CallOutcome::Failure) | None => {
                let written = cache.apply_error(batch.chain_id, call, batch.block);
                if written {
                    report.failed += 1;
                }
                written
            }
        };
        if !applied {
            report.superseded += 1;
        }
    }

    report
}

// ============================================
// TESTS
// ============================================
