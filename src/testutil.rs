//! Shared in-memory node backend for tests.

use alloy_primitives::{Address, B256, Bytes, U256, address, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::config::SignatureValidation;
use crate::envelope::PaymentEnvelope;
use crate::node::{
    BlockView, EvmCallError, EvmCallOutcome, MempoolError, NewTxsEvent, NodeBackend, StateError,
    StateView,
};
use crate::replay::ReplayGuard;
use crate::signature::{SignatureVerifier, canonical_message};
use crate::timestamp::UnixTimestamp;
use crate::types::{
    NETWORK_ID, PaymentPayload, PaymentPayloadData, PaymentRequirements, PermitData, SCHEME_EXACT,
};

pub(crate) const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
pub(crate) const ALLOWANCE_SELECTOR: [u8; 4] = [0xdd, 0x62, 0xed, 0x3e];
pub(crate) const PERMIT_SELECTOR: [u8; 4] = [0xd5, 0x05, 0xac, 0xcf];

pub(crate) const TEST_CHAIN_ID: u64 = 1776;
pub(crate) const TEST_TOKEN: Address = address!("00000000000000000000000000000000000000c3");
pub(crate) const TEST_RECIPIENT: Address = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");

/// A 32-byte return word carrying `value`.
pub(crate) fn uint_outcome(value: U256) -> EvmCallOutcome {
    EvmCallOutcome {
        return_data: Bytes::from(value.to_be_bytes::<32>().to_vec()),
        revert_data: Bytes::new(),
    }
}

type ScriptedCalls = HashMap<(Address, [u8; 4]), Result<EvmCallOutcome, String>>;

/// An in-memory [`NodeBackend`] with scripted EVM calls and a hand-built
/// chain.
pub(crate) struct MockNode {
    balances: Mutex<HashMap<Address, U256>>,
    state_fails: Mutex<bool>,
    calls: Mutex<ScriptedCalls>,
    submit_error: Mutex<Option<String>>,
    submitted: Mutex<Vec<std::sync::Arc<PaymentEnvelope>>>,
    mempool: Mutex<HashSet<B256>>,
    blocks: Mutex<Vec<BlockView>>,
    broadcasts: Mutex<Vec<B256>>,
    peers: AtomicUsize,
    event_senders: Mutex<Vec<mpsc::Sender<NewTxsEvent>>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            state_fails: Mutex::new(false),
            calls: Mutex::new(HashMap::new()),
            submit_error: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            mempool: Mutex::new(HashSet::new()),
            blocks: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            peers: AtomicUsize::new(1),
            event_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn set_balance(&self, owner: Address, balance: U256) {
        self.balances.lock().unwrap().insert(owner, balance);
    }

    pub fn fail_state(&self) {
        *self.state_fails.lock().unwrap() = true;
    }

    pub fn script_call(
        &self,
        to: Address,
        selector: [u8; 4],
        outcome: Result<EvmCallOutcome, String>,
    ) {
        self.calls.lock().unwrap().insert((to, selector), outcome);
    }

    pub fn script_revert(&self, to: Address, selector: [u8; 4]) {
        self.script_call(
            to,
            selector,
            Ok(EvmCallOutcome {
                return_data: Bytes::new(),
                revert_data: Bytes::from(vec![0x08, 0xc3, 0x79, 0xa0]),
            }),
        );
    }

    pub fn set_submit_error(&self, error: &str) {
        *self.submit_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn submitted(&self) -> Vec<std::sync::Arc<PaymentEnvelope>> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn mempool_insert(&self, hash: B256) {
        self.mempool.lock().unwrap().insert(hash);
    }

    pub fn mempool_remove(&self, hash: B256) {
        self.mempool.lock().unwrap().remove(&hash);
    }

    pub fn broadcasts(&self) -> Vec<B256> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn set_peers(&self, peers: usize) {
        self.peers.store(peers, Ordering::SeqCst);
    }

    /// Appends a block to the chain, linking it to the previous head.
    pub fn push_block(&self, transactions: Vec<B256>) {
        self.push_block_at(UnixTimestamp::now().0, transactions);
    }

    pub fn push_block_at(&self, timestamp: u64, transactions: Vec<B256>) {
        let mut blocks = self.blocks.lock().unwrap();
        let (number, parent_hash) = match blocks.last() {
            Some(parent) => (parent.number + 1, parent.hash),
            None => (0, B256::ZERO),
        };
        let hash = keccak256(number.to_be_bytes());
        blocks.push(BlockView {
            hash,
            parent_hash,
            number,
            timestamp,
            transactions,
        });
    }

    /// Delivers a mempool admission event to every subscriber.
    pub fn send_new_txs(&self, txs: Vec<std::sync::Arc<PaymentEnvelope>>) {
        let senders = self.event_senders.lock().unwrap();
        for sender in senders.iter() {
            let _ = sender.try_send(NewTxsEvent { txs: txs.clone() });
        }
    }
}

pub(crate) struct MockState {
    balances: HashMap<Address, U256>,
}

impl StateView for MockState {
    fn balance(&self, owner: Address) -> U256 {
        self.balances.get(&owner).copied().unwrap_or(U256::ZERO)
    }
}

#[async_trait]
impl NodeBackend for MockNode {
    type State = MockState;

    fn chain_id(&self) -> u64 {
        TEST_CHAIN_ID
    }

    fn state(&self) -> Result<Self::State, StateError> {
        if *self.state_fails.lock().unwrap() {
            return Err(StateError("mock state failure".into()));
        }
        Ok(MockState {
            balances: self.balances.lock().unwrap().clone(),
        })
    }

    async fn evm_call(&self, to: Address, data: Bytes) -> Result<EvmCallOutcome, EvmCallError> {
        let selector: [u8; 4] = data
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .unwrap_or_default();
        match self.calls.lock().unwrap().get(&(to, selector)) {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err(message)) => Err(EvmCallError(message.clone())),
            None => Ok(EvmCallOutcome::default()),
        }
    }

    async fn submit_transaction(
        &self,
        tx: std::sync::Arc<PaymentEnvelope>,
    ) -> Result<(), MempoolError> {
        if let Some(error) = self.submit_error.lock().unwrap().clone() {
            return Err(MempoolError(error));
        }
        let hash = tx.hash();
        self.mempool.lock().unwrap().insert(hash);
        self.submitted.lock().unwrap().push(tx);
        Ok(())
    }

    async fn mempool_contains(&self, hash: B256) -> bool {
        self.mempool.lock().unwrap().contains(&hash)
    }

    fn subscribe_new_transactions(&self) -> mpsc::Receiver<NewTxsEvent> {
        let (sender, receiver) = mpsc::channel(100);
        self.event_senders.lock().unwrap().push(sender);
        receiver
    }

    async fn current_block(&self) -> Option<BlockView> {
        self.blocks.lock().unwrap().last().cloned()
    }

    async fn block(&self, hash: B256, number: u64) -> Option<BlockView> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .find(|block| block.hash == hash && block.number == number)
            .cloned()
    }

    async fn broadcast_transactions(&self, txs: &[std::sync::Arc<PaymentEnvelope>]) {
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.extend(txs.iter().map(|tx| tx.hash()));
    }

    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }
}

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_nonce() -> B256 {
    let counter = NONCE_COUNTER.fetch_add(1, Ordering::SeqCst);
    B256::left_padding_from(&counter.to_be_bytes())
}

/// A signed payment plus everything needed to verify it.
pub(crate) struct TestPayment {
    pub payload: PaymentPayload,
    pub requirements: PaymentRequirements,
    pub signature_verifier: SignatureVerifier,
    pub replay: ReplayGuard,
}

impl TestPayment {
    /// A valid native-coin payment of 1 wei from a funded payer.
    pub fn native(node: &MockNode) -> Self {
        let far_future = i64::MAX as u64;
        Self::build(node, Address::ZERO, U256::from(1), 0, far_future)
    }

    pub fn native_with_window(node: &MockNode, valid_after: u64, valid_before: u64) -> Self {
        Self::build(node, Address::ZERO, U256::from(1), valid_after, valid_before)
    }

    /// A valid token payment of 100 base units. Token calls are left for the
    /// test to script.
    pub fn token(node: &MockNode) -> Self {
        let far_future = i64::MAX as u64;
        Self::build(node, TEST_TOKEN, U256::from(100), 0, far_future)
    }

    fn build(
        node: &MockNode,
        asset: Address,
        value: U256,
        valid_after: u64,
        valid_before: u64,
    ) -> Self {
        let key = B256::repeat_byte(0x17);
        let signer = PrivateKeySigner::from_bytes(&key).expect("valid test key");
        let from = signer.address();
        node.set_balance(from, U256::from(100));

        let mut data = PaymentPayloadData {
            from,
            to: TEST_RECIPIENT,
            value,
            valid_after: UnixTimestamp(valid_after),
            valid_before: UnixTimestamp(valid_before),
            nonce: next_nonce(),
            asset,
            signature: Bytes::new(),
            permit: None,
        };
        let message = canonical_message(&data, node.chain_id());
        let signature = signer
            .sign_message_sync(message.as_bytes())
            .expect("signing cannot fail");
        let mut raw = Vec::with_capacity(65);
        raw.extend_from_slice(&signature.r().to_be_bytes::<32>());
        raw.extend_from_slice(&signature.s().to_be_bytes::<32>());
        raw.push(27 + signature.v() as u8);
        data.signature = raw.into();

        let requirements = PaymentRequirements {
            scheme: SCHEME_EXACT.to_string(),
            network: NETWORK_ID.to_string(),
            max_amount_required: U256::from(1000),
            resource: "https://example.com/resource".to_string(),
            description: String::new(),
            mime_type: String::new(),
            pay_to: TEST_RECIPIENT,
            max_timeout_seconds: 60,
            asset,
        };
        let payload = PaymentPayload {
            x402_version: 1,
            scheme: SCHEME_EXACT.to_string(),
            network: NETWORK_ID.to_string(),
            payload: data,
        };
        Self {
            payload,
            requirements,
            signature_verifier: SignatureVerifier::new(
                node.chain_id(),
                SignatureValidation::Permissive,
            ),
            replay: ReplayGuard::new(),
        }
    }

    /// Attaches a permit. The payment signature does not cover permit
    /// fields, so no re-signing is needed.
    pub fn set_permit(&mut self, permit: PermitData) {
        self.payload.payload.permit = Some(permit);
    }
}
