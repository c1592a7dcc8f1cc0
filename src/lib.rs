//! Multicall Cache
//!
//! Block-driven batching and caching of EVM contract reads. Consumers
//! subscribe calls to a [`multicall::MulticallService`]; once per new block the
//! service sends every due call through a single Multicall3 `aggregate3`
//! request and caches results tagged by block number.

pub mod balances;
pub mod config;
pub mod multicall;
