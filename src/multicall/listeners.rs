//! Listener registry
//!
//! Tracks, per chain, which calls mounted consumers currently want and how
//! often. Every registration is reference counted per cadence so one consumer
//! leaving never drops another consumer's requirement.

use std::collections::{BTreeMap, HashMap};

use super::call::Call;
use super::ChainId;

/// How often a consumer wants a call refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Minimum number of new blocks between fetches
    pub blocks_per_fetch: u64,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self { blocks_per_fetch: 1 }
    }
}

impl ListenerOptions {
    pub fn every(blocks_per_fetch: u64) -> Self {
        Self { blocks_per_fetch }
    }

    /// Cadence actually used for bookkeeping (zero means every block)
    pub fn cadence(&self) -> u64 {
        self.blocks_per_fetch.max(1)
    }
}

#[derive(Debug, Clone)]
struct ListenerEntry {
    /// Registration order, used for stable batch ordering
    seq: u64,
    /// cadence -> number of active registrations
    cadences: BTreeMap<u64, usize>,
}

impl ListenerEntry {
    fn effective_cadence(&self) -> Option<u64> {
        self.cadences.keys().next().copied()
    }
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    chains: HashMap<ChainId, HashMap<Call, ListenerEntry>>,
    next_seq: u64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listeners(&mut self, chain_id: ChainId, calls: &[Call], options: ListenerOptions) {
        let cadence = options.cadence();
        let chain = self.chains.entry(chain_id).or_default();

        for call in calls {
            let entry = chain.entry(call.clone()).or_insert_with(|| {
                let seq = self.next_seq;
                self.next_seq += 1;
                ListenerEntry { seq, cadences: BTreeMap::new() }
            });
            *entry.cadences.entry(cadence).or_insert(0) += 1;
        }
    }

    /// Remove one registration per call; unknown pairs are ignored
    pub fn remove_listeners(&mut self, chain_id: ChainId, calls: &[Call], options: ListenerOptions) {
        let cadence = options.cadence();
        let Some(chain) = self.chains.get_mut(&chain_id) else {
            return;
        };

        for call in calls {
            let Some(entry) = chain.get_mut(call) else {
                continue;
            };
            let Some(count) = entry.cadences.get_mut(&cadence) else {
                continue;
            };

            *count -= 1;
            if *count == 0 {
                entry.cadences.remove(&cadence);
            }
            if entry.cadences.is_empty() {
                chain.remove(call);
            }
        }

        if chain.is_empty() {
            self.chains.remove(&chain_id);
        }
    }

    pub fn is_listening(&self, chain_id: ChainId, call: &Call) -> bool {
        self.chains
            .get(&chain_id)
            .map_or(false, |chain| chain.contains_key(call))
    }

    /// Most frequent cadence requested for a call, if anyone listens
    pub fn effective_cadence(&self, chain_id: ChainId, call: &Call) -> Option<u64> {
        self.chains
            .get(&chain_id)?
            .get(call)
            .and_then(ListenerEntry::effective_cadence)
    }

    /// Active calls with their effective cadence, in registration order
    pub fn active_calls(&self, chain_id: ChainId) -> Vec<(Call, u64)> {
        let Some(chain) = self.chains.get(&chain_id) else {
            return Vec::new();
        };

        let mut active: Vec<(u64, &Call, u64)> = chain
            .iter()
            .filter_map(|(call, entry)| {
                entry.effective_cadence().map(|cadence| (entry.seq, call, cadence))
            })
            .collect();
        active.sort_unstable_by_key(|(seq, _, _)| *seq);

        active
            .into_iter()
            .map(|(_, call, cadence)| (call.clone(), cadence))
            .collect()
    }

    pub fn listener_count(&self, chain_id: ChainId) -> usize {
        self.chains.get(&chain_id).map_or(0, HashMap::len)
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

// ============================================
// TESTS
// ============================================
