//! Result cache
//!
//! Latest known result per call per chain, tagged with the block it was read
//! at. Writes are ordered by block number: a response for an older block never
//! replaces a newer cached value, whatever order responses arrive in.

use alloy_primitives::Bytes;
use serde::Serialize;
use std::collections::HashMap;

use super::call::Call;
use super::listeners::ListenerRegistry;
use super::ChainId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// Last successful return data
    pub result: Option<Bytes>,
    /// Block the result was read at
    pub block_number: Option<u64>,
    /// Block of the request currently in flight
    pub fetching_block_number: Option<u64>,
    /// Last fetch for this call failed
    pub error: bool,
}

impl CacheEntry {
    /// Clear the in-flight marker if it belongs to `block` or an older request
    fn settle(&mut self, block: u64) {
        if self.fetching_block_number.map_or(false, |fetching| fetching <= block) {
            self.fetching_block_number = None;
        }
    }
}

/// Snapshot handed to consumers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallState {
    pub result: Option<Bytes>,
    pub block_number: Option<u64>,
    /// First fetch in flight, nothing to show yet
    pub is_loading: bool,
    /// Stale result shown while a refresh is in flight
    pub is_syncing: bool,
    pub error: bool,
}

impl From<&CacheEntry> for CallState {
    fn from(entry: &CacheEntry) -> Self {
        let in_flight = entry.fetching_block_number.is_some();
        let has_result = entry.result.is_some();
        Self {
            result: entry.result.clone(),
            block_number: entry.block_number,
            is_loading: in_flight && !has_result,
            is_syncing: in_flight && has_result,
            error: entry.error,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResultCache {
    chains: HashMap<ChainId, HashMap<Call, CacheEntry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, chain_id: ChainId, call: &Call) -> Option<&CacheEntry> {
        self.chains.get(&chain_id)?.get(call)
    }

    fn entry_mut(&mut self, chain_id: ChainId, call: &Call) -> &mut CacheEntry {
        self.chains
            .entry(chain_id)
            .or_default()
            .entry(call.clone())
            .or_default()
    }

    /// Record that a request for `block` is in flight. The marker only moves forward.
    pub fn mark_fetching(&mut self, chain_id: ChainId, call: &Call, block: u64) {
        let entry = self.entry_mut(chain_id, call);
        if entry.fetching_block_number.map_or(true, |fetching| fetching < block) {
            entry.fetching_block_number = Some(block);
        }
    }

    /// Store a successful result read at `block`.
    ///
    /// Returns `false` when a newer result is already cached and the write was dropped.
    pub fn apply_result(&mut self, chain_id: ChainId, call: &Call, block: u64, data: Bytes) -> bool {
        let entry = self.entry_mut(chain_id, call);
        entry.settle(block);

        if entry.block_number.map_or(false, |cached| cached > block) {
            return false;
        }

        entry.result = Some(data);
        entry.block_number = Some(block);
        entry.error = false;
        true
    }

    /// Record a failed read at `block`, keeping any previous result available.
    ///
    /// Returns `false` when a newer result already supersedes the failure.
    pub fn apply_error(&mut self, chain_id: ChainId, call: &Call, block: u64) -> bool {
        let entry = self.entry_mut(chain_id, call);
        entry.settle(block);

        if entry.block_number.map_or(false, |cached| cached > block) {
            return false;
        }

        entry.error = true;
        true
    }

    /// Non-blocking read; unknown calls read as the empty state
    pub fn read(&self, chain_id: ChainId, call: &Call) -> CallState {
        self.entry(chain_id, call).map(CallState::from).unwrap_or_default()
    }

    /// Evict entries nobody listens to. Returns the number removed.
    pub fn sweep(&mut self, chain_id: ChainId, listeners: &ListenerRegistry) -> usize {
        let Some(chain) = self.chains.get_mut(&chain_id) else {
            return 0;
        };

        let before = chain.len();
        chain.retain(|call, _| listeners.is_listening(chain_id, call));
        let evicted = before - chain.len();

        if chain.is_empty() {
            self.chains.remove(&chain_id);
        }
        evicted
    }

    pub fn len(&self, chain_id: ChainId) -> usize {
        self.chains.get(&chain_id).map_or(0, HashMap::len)
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicall::listeners::ListenerOptions;
    use alloy_primitives::{bytes, U256};

    const CHAIN: ChainId = 1;

    fn call() -> Call {
        Call::new(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "balanceOf(address)",
            vec![U256::from(1)],
        )
        .unwrap()
    }

    #[test]
    fn test_first_fetch_is_loading() {
        let mut cache = ResultCache::new();
        let c = call();

        assert_eq!(cache.read(CHAIN, &c), CallState::default());

        cache.mark_fetching(CHAIN, &c, 100);
        let state = cache.read(CHAIN, &c);
        assert!(state.is_loading);
        assert!(!state.is_syncing);
        assert_eq!(state.result, None);

        assert!(cache.apply_result(CHAIN, &c, 100, bytes!("64")));
        let state = cache.read(CHAIN, &c);
        assert!(!state.is_loading);
        assert_eq!(state.result, Some(bytes!("64")));
        assert_eq!(state.block_number, Some(100));
        assert_eq!(cache.entry(CHAIN, &c).unwrap().fetching_block_number, None);
    }

    #[test]
    fn test_stale_while_revalidate() {
        let mut cache = ResultCache::new();
        let c = call();

        cache.apply_result(CHAIN, &c, 100, bytes!("64"));
        cache.mark_fetching(CHAIN, &c, 101);

        let state = cache.read(CHAIN, &c);
        assert!(!state.is_loading);
        assert!(state.is_syncing);
        assert_eq!(state.result, Some(bytes!("64")));
        assert_eq!(state.block_number, Some(100));
    }

    #[test]
    fn test_monotonic_writes_in_either_order() {
        let c = call();

        let mut in_order = ResultCache::new();
        in_order.apply_result(CHAIN, &c, 99, bytes!("01"));
        in_order.apply_result(CHAIN, &c, 100, bytes!("02"));

        let mut reversed = ResultCache::new();
        reversed.apply_result(CHAIN, &c, 100, bytes!("02"));
        assert!(!reversed.apply_result(CHAIN, &c, 99, bytes!("01")));

        for cache in [in_order, reversed] {
            let state = cache.read(CHAIN, &c);
            assert_eq!(state.block_number, Some(100));
            assert_eq!(state.result, Some(bytes!("02")));
        }
    }

    #[test]
    fn test_error_keeps_stale_result() {
        let mut cache = ResultCache::new();
        let c = call();

        cache.apply_result(CHAIN, &c, 100, bytes!("64"));
        cache.mark_fetching(CHAIN, &c, 101);
        assert!(cache.apply_error(CHAIN, &c, 101));

        let entry = cache.entry(CHAIN, &c).unwrap();
        assert_eq!(entry.result, Some(bytes!("64")));
        assert_eq!(entry.block_number, Some(100));
        assert_eq!(entry.fetching_block_number, None);
        assert!(entry.error);

        // A later success clears the flag
        cache.apply_result(CHAIN, &c, 102, bytes!("65"));
        assert!(!cache.read(CHAIN, &c).error);
    }

    #[test]
    fn test_old_error_does_not_flag_newer_result() {
        let mut cache = ResultCache::new();
        let c = call();

        cache.apply_result(CHAIN, &c, 101, bytes!("64"));
        assert!(!cache.apply_error(CHAIN, &c, 100));
        assert!(!cache.read(CHAIN, &c).error);
    }

    #[test]
    fn test_late_response_keeps_newer_fetch_marker() {
        let mut cache = ResultCache::new();
        let c = call();

        cache.mark_fetching(CHAIN, &c, 100);
        cache.mark_fetching(CHAIN, &c, 105);
        cache.apply_result(CHAIN, &c, 100, bytes!("64"));

        let entry = cache.entry(CHAIN, &c).unwrap();
        assert_eq!(entry.fetching_block_number, Some(105));
        assert!(cache.read(CHAIN, &c).is_syncing);

        // Marker never moves backwards
        cache.mark_fetching(CHAIN, &c, 103);
        assert_eq!(cache.entry(CHAIN, &c).unwrap().fetching_block_number, Some(105));
    }

    #[test]
    fn test_sweep_respects_listeners() {
        let mut cache = ResultCache::new();
        let mut listeners = ListenerRegistry::new();
        let kept = call();
        let dropped = Call::new(
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2",
            "totalSupply()",
            vec![],
        )
        .unwrap();

        listeners.add_listeners(CHAIN, &[kept.clone()], ListenerOptions::default());
        cache.apply_result(CHAIN, &kept, 1, bytes!("01"));
        cache.apply_result(CHAIN, &dropped, 1, bytes!("02"));

        assert_eq!(cache.sweep(CHAIN, &listeners), 1);
        assert!(cache.entry(CHAIN, &kept).is_some());
        assert!(cache.entry(CHAIN, &dropped).is_none());
        assert_eq!(cache.sweep(CHAIN, &listeners), 0);
    }
}
