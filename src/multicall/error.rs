//! Error taxonomy for call construction and key handling.
//!
//! Fetch failures are not represented here: they are recorded as data in the
//! result cache (`CacheEntry::error`) and never surface as `Err` to readers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MulticallError {
    /// Address failed the chain's address-format check
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Method name cannot be represented in a call key
    #[error("invalid method name: {0:?}")]
    InvalidMethodName(String),

    /// Call key could not be parsed back into a call
    #[error("malformed call key: {0}")]
    MalformedKey(String),
}
