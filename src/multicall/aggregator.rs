//! Aggregator boundary
//!
//! The scheduler hands a batch of calls to an [`Aggregator`] and gets one
//! outcome per call back. The production implementation executes the whole
//! batch as a single Multicall3 `aggregate3` eth_call pinned to the block being
//! refreshed, with `allowFailure` set so one reverting call never sinks the rest.

use alloy_eips::BlockId;
use alloy_primitives::{address, Address, Bytes};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::{sol, SolCall};
use eyre::{eyre, Result};
use futures::future::BoxFuture;
use std::time::Instant;
use tracing::{debug, trace};

use super::call::Call;
use super::ChainId;

// ============================================
// MULTICALL3 INTERFACE
// ============================================

sol! {
    /// Multicall3 - deployed at same address on all EVM chains
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls)
            external payable returns (Result[] memory returnData);

        function getEthBalance(address addr) external view returns (uint256 balance);
    }
}

/// Multicall3 address (same on all EVM chains)
pub const MULTICALL3: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// Result of a single call inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(Bytes),
    Failure,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }
}

/// Executes many reads in one round trip.
///
/// Implementations must return exactly one outcome per input call, in order.
/// An `Err` means the whole batch failed.
pub trait Aggregator: Send + Sync + 'static {
    fn aggregate<'a>(
        &'a self,
        chain_id: ChainId,
        block: u64,
        calls: &'a [Call],
    ) -> BoxFuture<'a, Result<Vec<CallOutcome>>>;
}

// ============================================
// MULTICALL3 AGGREGATOR
// ============================================

pub struct Multicall3Aggregator {
    rpc_url: String,
    chain_id: ChainId,
    multicall: Address,
}

impl Multicall3Aggregator {
    pub fn new(rpc_url: String, chain_id: ChainId, multicall: Address) -> Self {
        Self { rpc_url, chain_id, multicall }
    }

    pub fn multicall_address(&self) -> Address {
        self.multicall
    }

    async fn execute_multicall(&self, block: u64, calls: &[Call]) -> Result<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let provider = ProviderBuilder::new()
            .connect_http(self.rpc_url.parse()?);

        let batch = encode_batch(calls);
        let calldata = IMulticall3::aggregate3Call { calls: batch }.abi_encode();

        let tx = TransactionRequest::default()
            .to(self.multicall)
            .input(calldata.into());

        let result = provider
            .call(tx)
            .block(BlockId::number(block))
            .await
            .map_err(|e| eyre!("Multicall3 failed at block {}: {}", block, e))?;

        let outcomes = decode_outcomes(&result)?;

        debug!(
            "⚡ Multicall3: {} calls at block {} in {:?} ({} failed)",
            calls.len(),
            block,
            start.elapsed(),
            outcomes.iter().filter(|o| !o.is_success()).count()
        );

        Ok(outcomes)
    }
}

impl Aggregator for Multicall3Aggregator {
    fn aggregate<'a>(
        &'a self,
        chain_id: ChainId,
        block: u64,
        calls: &'a [Call],
    ) -> BoxFuture<'a, Result<Vec<CallOutcome>>> {
        Box::pin(async move {
            if chain_id != self.chain_id {
                return Err(eyre!(
                    "aggregator is bound to chain {}, got request for chain {}",
                    self.chain_id,
                    chain_id
                ));
            }
            self.execute_multicall(block, calls).await
        })
    }
}

fn encode_batch(calls: &[Call]) -> Vec<IMulticall3::Call3> {
    calls
        .iter()
        .map(|call| {
            trace!("batching {}", call);
            IMulticall3::Call3 {
                target: call.address(),
                allowFailure: true,
                callData: call.calldata(),
            }
        })
        .collect()
}

fn decode_outcomes(raw: &[u8]) -> Result<Vec<CallOutcome>> {
    let decoded = IMulticall3::aggregate3Call::abi_decode_returns(raw)
        .map_err(|e| eyre!("Failed to decode multicall result: {}", e))?;

    Ok(decoded
        .into_iter()
        .map(|r| {
            if r.success {
                CallOutcome::Success(r.returnData)
            } else {
                CallOutcome::Failure
            }
        })
        .collect())
}

// ============================================
// TESTS
// ============================================
