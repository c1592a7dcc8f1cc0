//! Call encoder
//!
//! A `Call` identifies one logical contract read. Inside the service calls are
//! keyed structurally (`Eq + Hash`); the string key produced by [`encode`] is
//! the portable form used in logs, snapshots and config.
//!
//! Key layout: `address-method-len[-arg]*`
//! - address: EIP-55 checksummed
//! - method: canonical Solidity signature, e.g. `balanceOf(address)`
//! - args: `0x`-prefixed lowercase hex words, no leading zeros

use alloy_primitives::{keccak256, Address, Bytes, U256};
use std::fmt;
use std::str::FromStr;

use super::error::MulticallError;

/// Separator between key segments
pub const KEY_SEPARATOR: char = '-';

/// address, method, argument count
const MIN_KEY_SEGMENTS: usize = 3;

/// One contract read: target, method signature and ABI argument words
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    address: Address,
    method_name: String,
    call_data: Vec<U256>,
}

impl Call {
    /// Build a call from an address string, validating both address and method
    pub fn new(
        address: &str,
        method_name: impl Into<String>,
        call_data: Vec<U256>,
    ) -> Result<Self, MulticallError> {
        let address = parse_address(address)
            .ok_or_else(|| MulticallError::InvalidAddress(address.to_string()))?;
        Self::from_address(address, method_name, call_data)
    }

    /// Build a call for an already-parsed address
    pub fn from_address(
        address: Address,
        method_name: impl Into<String>,
        call_data: Vec<U256>,
    ) -> Result<Self, MulticallError> {
        if address == Address::ZERO {
            return Err(MulticallError::InvalidAddress(address.to_checksum(None)));
        }
        let method_name = method_name.into();
        validate_method_name(&method_name)?;
        Ok(Self { address, method_name, call_data })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn call_data(&self) -> &[U256] {
        &self.call_data
    }

    /// 4-byte function selector of the method signature
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.method_name.as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// ABI calldata: selector followed by one 32-byte big-endian word per argument
    pub fn calldata(&self) -> Bytes {
        let mut data = Vec::with_capacity(4 + 32 * self.call_data.len());
        data.extend_from_slice(&self.selector());
        for word in &self.call_data {
            data.extend_from_slice(&word.to_be_bytes::<32>());
        }
        Bytes::from(data)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.call_data.iter().map(format_word).collect::<Vec<_>>().join(", ");
        write!(f, "{}::{}[{}]", short_address(&self.address), self.method_name, args)
    }
}

/// Address-validity predicate: `0x` + 40 hex digits, non-zero,
/// and a matching EIP-55 checksum when the input is mixed case.
pub fn is_valid_address(candidate: &str) -> bool {
    parse_address(candidate).is_some()
}

/// Encode a call into its canonical string key
pub fn encode(call: &Call) -> Result<String, MulticallError> {
    if call.address == Address::ZERO {
        return Err(MulticallError::InvalidAddress(call.address.to_checksum(None)));
    }

    let mut key = format!(
        "{}{sep}{}{sep}{}",
        call.address.to_checksum(None),
        call.method_name,
        call.call_data.len(),
        sep = KEY_SEPARATOR,
    );
    for word in &call.call_data {
        key.push(KEY_SEPARATOR);
        key.push_str(&format_word(word));
    }
    Ok(key)
}

/// Parse a key produced by [`encode`] back into a call
pub fn decode(key: &str) -> Result<Call, MulticallError> {
    let malformed = || MulticallError::MalformedKey(key.to_string());

    let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if segments.len() < MIN_KEY_SEGMENTS {
        return Err(malformed());
    }

    let address = parse_address(segments[0]).ok_or_else(malformed)?;
    // Only the checksummed spelling is canonical
    if address.to_checksum(None) != segments[0] {
        return Err(malformed());
    }

    let method_name = segments[1];
    if validate_method_name(method_name).is_err() {
        return Err(malformed());
    }

    let len: usize = segments[2].parse().map_err(|_| malformed())?;
    let args = &segments[MIN_KEY_SEGMENTS..];
    if args.len() != len || segments[2] != len.to_string() {
        return Err(malformed());
    }

    let mut call_data = Vec::with_capacity(len);
    for arg in args {
        let word = parse_word(arg).ok_or_else(malformed)?;
        call_data.push(word);
    }

    Ok(Call { address, method_name: method_name.to_string(), call_data })
}

/// Same method and arguments against one contract per argument set
pub fn single_contract_multiple_data(
    address: Address,
    method_name: &str,
    arg_sets: &[Vec<U256>],
) -> Result<Vec<Call>, MulticallError> {
    arg_sets
        .iter()
        .map(|args| Call::from_address(address, method_name, args.clone()))
        .collect()
}

/// Same method and arguments against many contracts
pub fn multiple_contracts_single_data(
    addresses: &[Address],
    method_name: &str,
    args: &[U256],
) -> Result<Vec<Call>, MulticallError> {
    addresses
        .iter()
        .map(|address| Call::from_address(*address, method_name, args.to_vec()))
        .collect()
}

/// ABI word for an address argument
pub fn address_word(address: Address) -> U256 {
    U256::from_be_slice(address.as_slice())
}

fn parse_address(candidate: &str) -> Option<Address> {
    let digits = candidate.strip_prefix("0x")?;
    if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let address = Address::from_str(candidate).ok()?;
    if address == Address::ZERO {
        return None;
    }

    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower && address.to_checksum(None) != candidate {
        return None;
    }

    Some(address)
}

fn validate_method_name(method_name: &str) -> Result<(), MulticallError> {
    if method_name.is_empty()
        || method_name.contains(KEY_SEPARATOR)
        || method_name.chars().any(char::is_whitespace)
    {
        return Err(MulticallError::InvalidMethodName(method_name.to_string()));
    }
    Ok(())
}

fn format_word(word: &U256) -> String {
    format!("0x{:x}", word)
}

fn parse_word(segment: &str) -> Option<U256> {
    let digits = segment.strip_prefix("0x")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let word = U256::from_str(segment).ok()?;
    // Reject non-canonical spellings (uppercase, leading zeros)
    (format_word(&word) == segment).then_some(word)
}

fn short_address(address: &Address) -> String {
    let full = address.to_checksum(None);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

// ============================================
// TESTS
// ============================================
