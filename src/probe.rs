//! Read-only asset queries against the node's EVM.
//!
//! Token balances and allowances are fetched with hand-assembled calldata
//! (4-byte selector plus 32-byte words) evaluated as dry runs on the latest
//! state. A provided permit is likewise simulated as a dry run; the
//! simulation succeeding means the token would accept it at execution time.
//! None of these queries write state.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use once_cell::sync::Lazy;

use crate::node::{EvmCallError, NodeBackend};
use crate::types::PermitData;

static BALANCE_OF_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| selector("balanceOf(address)"));
static ALLOWANCE_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| selector("allowance(address,address)"));
static PERMIT_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| selector("permit(address,address,uint256,uint256,uint8,bytes32,bytes32)"));

fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn pad_address(address: Address) -> B256 {
    B256::left_padding_from(address.as_slice())
}

/// Calldata for `balanceOf(owner)`.
pub fn balance_of_calldata(owner: Address) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&*BALANCE_OF_SELECTOR);
    data.extend_from_slice(pad_address(owner).as_slice());
    data.into()
}

/// Calldata for `allowance(owner, spender)`.
pub fn allowance_calldata(owner: Address, spender: Address) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&*ALLOWANCE_SELECTOR);
    data.extend_from_slice(pad_address(owner).as_slice());
    data.extend_from_slice(pad_address(spender).as_slice());
    data.into()
}

/// Calldata for `permit(owner, spender, value, deadline, v, r, s)`.
///
/// A missing value encodes as zero and a missing deadline as the maximum
/// `u64`. `r` and `s` shorter than 32 bytes are left-padded; longer ones
/// cannot form a valid word and yield `None`.
pub fn permit_calldata(owner: Address, spender: Address, permit: &PermitData) -> Option<Bytes> {
    if permit.r.len() > 32 || permit.s.len() > 32 {
        return None;
    }
    let value = permit.value.unwrap_or(U256::ZERO);
    let deadline = permit.deadline.unwrap_or_else(|| U256::from(u64::MAX));
    let mut data = Vec::with_capacity(4 + 32 * 7);
    data.extend_from_slice(&*PERMIT_SELECTOR);
    data.extend_from_slice(pad_address(owner).as_slice());
    data.extend_from_slice(pad_address(spender).as_slice());
    data.extend_from_slice(&value.to_be_bytes::<32>());
    data.extend_from_slice(&deadline.to_be_bytes::<32>());
    data.extend_from_slice(B256::left_padding_from(&[permit.v]).as_slice());
    data.extend_from_slice(B256::left_padding_from(&permit.r).as_slice());
    data.extend_from_slice(B256::left_padding_from(&permit.s).as_slice());
    Some(data.into())
}

/// Decodes a uint256 return word. An empty return is zero; anything beyond
/// the first word is ignored.
fn decode_uint256(out: &[u8]) -> U256 {
    if out.is_empty() {
        U256::ZERO
    } else if out.len() <= 32 {
        U256::from_be_slice(out)
    } else {
        U256::from_be_slice(&out[..32])
    }
}

/// Read-only token queries evaluated through the node backend.
#[derive(Debug)]
pub struct AssetProbe<'a, N> {
    backend: &'a N,
}

impl<'a, N: NodeBackend> AssetProbe<'a, N> {
    pub fn new(backend: &'a N) -> Self {
        Self { backend }
    }

    /// `balanceOf(owner)` on the token contract.
    pub async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, EvmCallError> {
        let outcome = self
            .backend
            .evm_call(token, balance_of_calldata(owner))
            .await?;
        Ok(decode_uint256(&outcome.return_data))
    }

    /// `allowance(owner, spender)` on the token contract.
    pub async fn token_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, EvmCallError> {
        let outcome = self
            .backend
            .evm_call(token, allowance_calldata(owner, spender))
            .await?;
        Ok(decode_uint256(&outcome.return_data))
    }

    /// Dry-runs `permit(owner, spender, ...)`. `Ok(true)` means the call ran
    /// without reverting.
    pub async fn simulate_permit(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        permit: &PermitData,
    ) -> Result<bool, EvmCallError> {
        let Some(data) = permit_calldata(owner, spender, permit) else {
            return Ok(false);
        };
        let outcome = self.backend.evm_call(token, data).await?;
        Ok(!outcome.reverted())
    }
}
