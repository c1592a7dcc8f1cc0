//! Token balance reads on top of the multicall service
//!
//! Builds the `balanceOf` / `decimals` / `getEthBalance` calls a wallet view
//! needs and decodes whatever the cache currently holds for them. Balances are
//! eventually consistent: a token missing from the result has not been read
//! successfully yet.

use alloy_primitives::{utils::format_units, Address, U256};
use alloy_sol_types::{sol, SolCall};
use std::collections::HashMap;

use crate::multicall::{address_word, Call, CallState, ChainId, MulticallError, MulticallService};

sol! {
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }

    interface IMulticall3Balance {
        function getEthBalance(address addr) external view returns (uint256 balance);
    }
}

pub const BALANCE_OF: &str = "balanceOf(address)";
pub const DECIMALS: &str = "decimals()";
pub const GET_ETH_BALANCE: &str = "getEthBalance(address)";

fn balance_call(account: Address, token: Address) -> Option<Call> {
    Call::from_address(token, BALANCE_OF, vec![address_word(account)]).ok()
}

/// One `balanceOf(account)` call per valid token. Invalid tokens are skipped.
pub fn token_balance_calls(account: Address, tokens: &[Address]) -> Vec<Call> {
    tokens.iter().filter_map(|token| balance_call(account, *token)).collect()
}

/// One `decimals()` call per valid token
pub fn token_decimals_calls(tokens: &[Address]) -> Vec<Call> {
    tokens
        .iter()
        .filter_map(|token| Call::from_address(*token, DECIMALS, Vec::new()).ok())
        .collect()
}

/// Native balance through Multicall3's `getEthBalance`
pub fn native_balance_call(multicall: Address, account: Address) -> Result<Call, MulticallError> {
    Call::from_address(multicall, GET_ETH_BALANCE, vec![address_word(account)])
}

/// Decode a single `uint256` return (balanceOf, getEthBalance)
pub fn decode_amount(state: &CallState) -> Option<U256> {
    let data = state.result.as_ref()?;
    IERC20::balanceOfCall::abi_decode_returns(data).ok()
}

pub fn decode_decimals(state: &CallState) -> Option<u8> {
    let data = state.result.as_ref()?;
    IERC20::decimalsCall::abi_decode_returns(data).ok()
}

/// Human readable amount, falling back to the raw integer for odd decimals
pub fn format_amount(amount: U256, decimals: u8) -> String {
    format_units(amount, decimals).unwrap_or_else(|_| amount.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBalances {
    /// Decoded balances keyed by token
    pub balances: HashMap<Address, U256>,
    /// Some balance has not been read for the first time yet
    pub any_loading: bool,
}

/// Current token balances of `account` as cached by `service`
pub fn token_balances(
    service: &MulticallService,
    chain_id: ChainId,
    account: Address,
    tokens: &[Address],
) -> TokenBalances {
    let calls = token_balance_calls(account, tokens);
    let states = service.get_call_results(chain_id, &calls);

    let any_loading = states.iter().any(|s| s.is_loading);
    let balances = calls
        .iter()
        .zip(states.iter())
        .filter_map(|(call, state)| decode_amount(state).map(|amount| (call.address(), amount)))
        .collect();

    TokenBalances { balances, any_loading }
}
