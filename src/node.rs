//! The narrow façade this adapter consumes from the host node.
//!
//! The adapter never owns blockchain state, an EVM executor, a mempool, or a
//! peer set. The host node implements [`NodeBackend`] over its own internals
//! and hands the adapter an `Arc` of it. Everything the adapter does goes
//! through this trait, which keeps the surface small enough to mock in tests.

use alloy_primitives::{Address, B256, Bytes, U256, address};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::envelope::PaymentEnvelope;

/// The well-known pseudo-sender account envelopes are attributed to.
pub const PSEUDO_SENDER: Address = address!("0000000000000000000000000000000000000402");

/// One native coin in wei. The pseudo-sender should hold at least this much.
pub const PSEUDO_SENDER_MIN_BALANCE: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Latest committed state could not be opened.
#[derive(Debug, thiserror::Error)]
#[error("state unavailable: {0}")]
pub struct StateError(pub String);

/// A dry-run EVM call failed before producing an outcome (timeout, executor
/// setup failure, unknown block). Distinct from a revert, which is an
/// outcome.
#[derive(Debug, thiserror::Error)]
#[error("evm call failed: {0}")]
pub struct EvmCallError(pub String);

/// The mempool refused a transaction.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MempoolError(pub String);

/// Outcome of a dry-run EVM call that ran to completion.
///
/// `return_data` is empty when the call reverted; `revert_data` carries the
/// revert payload in that case.
#[derive(Debug, Clone, Default)]
pub struct EvmCallOutcome {
    pub return_data: Bytes,
    pub revert_data: Bytes,
}

impl EvmCallOutcome {
    pub fn reverted(&self) -> bool {
        !self.revert_data.is_empty()
    }
}

/// A read-only view of one block, sufficient for inclusion scanning.
#[derive(Debug, Clone)]
pub struct BlockView {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    /// Block timestamp in Unix seconds.
    pub timestamp: u64,
    /// Hashes of the transactions the block includes.
    pub transactions: Vec<B256>,
}

/// Batch of transactions newly admitted to the mempool.
///
/// The node may deliver transactions of any type; consumers filter on
/// [`PaymentEnvelope::tx_type`].
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Arc<PaymentEnvelope>>,
}

/// A snapshot of the latest committed state.
pub trait StateView: Send {
    fn balance(&self, owner: Address) -> U256;
}

/// Host-node services the adapter depends on.
#[async_trait]
pub trait NodeBackend: Send + Sync + 'static {
    type State: StateView;

    /// Chain identifier from the node configuration.
    fn chain_id(&self) -> u64;

    /// Opens the latest committed state.
    fn state(&self) -> Result<Self::State, StateError>;

    /// Executes `data` against `to` as a dry run on the latest state, under
    /// the node's configured EVM call timeout and gas cap. Never writes.
    async fn evm_call(&self, to: Address, data: Bytes) -> Result<EvmCallOutcome, EvmCallError>;

    /// Admits a transaction to the local mempool.
    async fn submit_transaction(&self, tx: Arc<PaymentEnvelope>) -> Result<(), MempoolError>;

    /// Whether the mempool currently holds a transaction with this hash.
    async fn mempool_contains(&self, hash: B256) -> bool;

    /// Subscribes to mempool admissions. Dropping the receiver unsubscribes.
    fn subscribe_new_transactions(&self) -> mpsc::Receiver<NewTxsEvent>;

    /// The current chain head, if the chain has one.
    async fn current_block(&self) -> Option<BlockView>;

    /// Looks up a block by hash and number.
    async fn block(&self, hash: B256, number: u64) -> Option<BlockView>;

    /// Hands transactions to the node's peer broadcast path.
    async fn broadcast_transactions(&self, txs: &[Arc<PaymentEnvelope>]);

    /// Number of currently connected peers.
    fn peer_count(&self) -> usize;
}

#[async_trait]
impl<N: NodeBackend> NodeBackend for Arc<N> {
    type State = N::State;

    fn chain_id(&self) -> u64 {
        self.as_ref().chain_id()
    }

    fn state(&self) -> Result<Self::State, StateError> {
        self.as_ref().state()
    }

    async fn evm_call(&self, to: Address, data: Bytes) -> Result<EvmCallOutcome, EvmCallError> {
        self.as_ref().evm_call(to, data).await
    }

    async fn submit_transaction(&self, tx: Arc<PaymentEnvelope>) -> Result<(), MempoolError> {
        self.as_ref().submit_transaction(tx).await
    }

    async fn mempool_contains(&self, hash: B256) -> bool {
        self.as_ref().mempool_contains(hash).await
    }

    fn subscribe_new_transactions(&self) -> mpsc::Receiver<NewTxsEvent> {
        self.as_ref().subscribe_new_transactions()
    }

    async fn current_block(&self) -> Option<BlockView> {
        self.as_ref().current_block().await
    }

    async fn block(&self, hash: B256, number: u64) -> Option<BlockView> {
        self.as_ref().block(hash, number).await
    }

    async fn broadcast_transactions(&self, txs: &[Arc<PaymentEnvelope>]) {
        self.as_ref().broadcast_transactions(txs).await
    }

    fn peer_count(&self) -> usize {
        self.as_ref().peer_count()
    }
}

/// Outcome of the startup funding check on the pseudo-sender account.
#[derive(Debug, Clone)]
pub struct FundingStatus {
    pub address: Address,
    /// `None` when state could not be read.
    pub balance: Option<U256>,
    pub funded: bool,
}

/// Checks whether the pseudo-sender holds at least one native coin and logs
/// the verdict. Diagnostic only: the adapter keeps working either way.
pub fn check_pseudo_sender_funding<N: NodeBackend>(backend: &N) -> FundingStatus {
    let state = match backend.state() {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(%err, "could not read state to check pseudo-sender balance");
            return FundingStatus {
                address: PSEUDO_SENDER,
                balance: None,
                funded: false,
            };
        }
    };
    let balance = state.balance(PSEUDO_SENDER);
    let funded = balance >= PSEUDO_SENDER_MIN_BALANCE;
    if funded {
        tracing::info!(%balance, "pseudo-sender adequately funded");
    } else {
        tracing::warn!(
            address = %PSEUDO_SENDER,
            %balance,
            required = %PSEUDO_SENDER_MIN_BALANCE,
            "pseudo-sender account needs manual funding"
        );
    }
    FundingStatus {
        address: PSEUDO_SENDER,
        balance: Some(balance),
        funded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockNode;

    #[test]
    fn funding_check_reports_balance_against_threshold() {
        let node = MockNode::new();
        node.set_balance(PSEUDO_SENDER, PSEUDO_SENDER_MIN_BALANCE);
        let status = check_pseudo_sender_funding(&node);
        assert!(status.funded);
        assert_eq!(status.balance, Some(PSEUDO_SENDER_MIN_BALANCE));

        node.set_balance(PSEUDO_SENDER, U256::from(1));
        assert!(!check_pseudo_sender_funding(&node).funded);
    }

    #[test]
    fn funding_check_survives_unreadable_state() {
        let node = MockNode::new();
        node.fail_state();
        let status = check_pseudo_sender_funding(&node);
        assert!(!status.funded);
        assert!(status.balance.is_none());
    }
}
