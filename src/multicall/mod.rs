//! Multicall layer
//!
//! Aggregates contract reads requested by many independent consumers into
//! batched Multicall3 requests, one round of batches per new block, and caches
//! results per call with stale-while-revalidate semantics.
//!
//! - `call`: call identity and key encoding
//! - `listeners`: who wants which call, how often
//! - `scheduler`: due-set selection and batching
//! - `cache`: results tagged by block number
//! - `aggregator`: the network boundary (Multicall3)
//! - `block_source`: new block heights
//! - `service`: the owned context consumers talk to

pub mod aggregator;
pub mod block_source;
pub mod cache;
pub mod call;
pub mod error;
pub mod listeners;
pub mod scheduler;
pub mod service;

/// EVM chain id
pub type ChainId = u64;

pub use aggregator::{Aggregator, CallOutcome, Multicall3Aggregator, MULTICALL3};
pub use block_source::BlockWatcher;
pub use cache::CallState;
pub use call::{address_word, decode, encode, is_valid_address, Call};
pub use error::MulticallError;
pub use listeners::ListenerOptions;
pub use service::{MulticallConfig, MulticallService, Subscription};
