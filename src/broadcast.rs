//! The propagation manager.
//!
//! Settled envelopes are admitted to the local mempool, but x402 envelopes
//! historically failed to reach validators through normal gossip alone. This
//! subsystem closes that gap: it tracks every pending x402 envelope, pushes
//! it to peers immediately and again on a fixed tick while it stays in the
//! mempool, and retires it once it is observed in a recent block or has
//! vanished from the mempool.
//!
//! Three tasks share the pending map behind a readers-writer lock:
//!
//! - the mempool subscriber enrolls every x402-typed transaction that enters
//!   the pool, whatever path it took to get there;
//! - the broadcast worker drains a bounded work queue and re-broadcasts all
//!   still-pooled envelopes every [`REBROADCAST_INTERVAL`];
//! - the block monitor walks the last [`BLOCK_SCAN_DEPTH`] blocks every
//!   [`BLOCK_SCAN_INTERVAL`] to retire envelopes that left the mempool.
//!
//! [`PropagationManager::stop`] cancels all three and waits for them to
//! finish. A task that panics is logged at join time; the process keeps
//! running.

use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::envelope::{PaymentEnvelope, X402_TX_TYPE};
use crate::node::{BlockView, NodeBackend};

/// Capacity of the immediate-broadcast work queue.
pub const BROADCAST_QUEUE_CAPACITY: usize = 100;

/// How often still-pending envelopes are re-broadcast.
pub const REBROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// How often the block monitor checks for inclusion.
pub const BLOCK_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// How many blocks back the inclusion scan looks.
pub const BLOCK_SCAN_DEPTH: u64 = 5;

/// Tracks and re-broadcasts pending payment envelopes until they land in a
/// block or drop out of the mempool.
#[derive(Debug)]
pub struct PropagationManager<N: NodeBackend> {
    shared: Arc<Shared<N>>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared<N> {
    backend: Arc<N>,
    pending: RwLock<HashMap<B256, Arc<PaymentEnvelope>>>,
    queue: mpsc::Sender<Arc<PaymentEnvelope>>,
}

impl<N: NodeBackend> PropagationManager<N> {
    /// Spawns the three worker tasks and returns the running manager.
    pub fn start(backend: Arc<N>) -> Self {
        let (queue, queue_rx) = mpsc::channel(BROADCAST_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            backend,
            pending: RwLock::new(HashMap::new()),
            queue,
        });
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(subscriber_loop(Arc::clone(&shared), cancel.clone())),
            tokio::spawn(broadcast_loop(Arc::clone(&shared), queue_rx, cancel.clone())),
            tokio::spawn(monitor_loop(Arc::clone(&shared), cancel.clone())),
        ];
        Self {
            shared,
            cancel,
            tasks: StdMutex::new(tasks),
        }
    }

    /// Enrolls an envelope for tracking and broadcast. Non-x402 transaction
    /// types are ignored. Enrolling an already-tracked envelope is a no-op.
    pub async fn enroll(&self, tx: Arc<PaymentEnvelope>) {
        self.shared.enroll(tx).await;
    }

    /// Number of envelopes currently tracked.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.read().await.len()
    }

    /// Cancels all worker tasks and waits for them to exit. The mempool
    /// subscription ends when the subscriber task drops its receiver.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!(%err, "propagation task panicked");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn rebroadcast_once(&self) {
        self.shared.rebroadcast_pending().await;
    }

    #[cfg(test)]
    pub(crate) async fn scan_once(&self) {
        self.shared.scan_recent_blocks().await;
    }

    #[cfg(test)]
    pub(crate) async fn locate_in_recent_blocks(&self, hash: B256) -> Option<u64> {
        let head = self.shared.backend.current_block().await?;
        self.shared.find_in_recent_blocks(&head, hash).await
    }
}

impl<N: NodeBackend> Shared<N> {
    async fn enroll(&self, tx: Arc<PaymentEnvelope>) {
        if tx.tx_type() != X402_TX_TYPE {
            return;
        }
        let hash = tx.hash();
        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&hash) {
                return;
            }
            pending.insert(hash, Arc::clone(&tx));
        }
        tracing::info!(%hash, "tracking payment envelope for broadcast");
        if self.queue.try_send(tx).is_err() {
            // Still tracked; the re-broadcast tick picks it up.
            tracing::warn!(%hash, "broadcast queue unavailable, envelope waits for the next tick");
        }
    }

    async fn retire(&self, hash: B256) -> bool {
        self.pending.write().await.remove(&hash).is_some()
    }

    async fn broadcast(&self, tx: &Arc<PaymentEnvelope>) {
        self.backend
            .broadcast_transactions(std::slice::from_ref(tx))
            .await;
        tracing::debug!(hash = %tx.hash(), "broadcasted payment envelope to peers");
    }

    /// Re-broadcasts every tracked envelope that is still pooled and retires
    /// the ones that are not.
    async fn rebroadcast_pending(&self) {
        let pending: Vec<Arc<PaymentEnvelope>> =
            self.pending.read().await.values().cloned().collect();
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "re-broadcasting pending payment envelopes");
        for tx in pending {
            let hash = tx.hash();
            if self.backend.mempool_contains(hash).await {
                self.broadcast(&tx).await;
            } else if self.retire(hash).await {
                tracing::debug!(%hash, "payment envelope left the mempool, untracked");
            }
        }
    }

    /// Retires envelopes that left the mempool, distinguishing the ones that
    /// made it into a recent block from the ones that simply vanished.
    async fn scan_recent_blocks(&self) {
        let hashes: Vec<B256> = self.pending.read().await.keys().copied().collect();
        if hashes.is_empty() {
            return;
        }
        let Some(head) = self.backend.current_block().await else {
            return;
        };
        for hash in hashes {
            if self.backend.mempool_contains(hash).await {
                continue;
            }
            match self.find_in_recent_blocks(&head, hash).await {
                Some(number) => {
                    if self.retire(hash).await {
                        tracing::info!(%hash, block = number, "payment envelope confirmed in block");
                    }
                }
                None => {
                    if self.retire(hash).await {
                        tracing::debug!(%hash, "payment envelope neither pooled nor mined, dropped");
                    }
                }
            }
        }
    }

    async fn find_in_recent_blocks(&self, head: &BlockView, hash: B256) -> Option<u64> {
        let mut block = head.clone();
        for _ in 0..BLOCK_SCAN_DEPTH {
            if block.transactions.contains(&hash) {
                return Some(block.number);
            }
            if block.number == 0 {
                break;
            }
            block = self.backend.block(block.parent_hash, block.number - 1).await?;
        }
        None
    }
}

async fn subscriber_loop<N: NodeBackend>(shared: Arc<Shared<N>>, cancel: CancellationToken) {
    let mut events = shared.backend.subscribe_new_transactions();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    for tx in event.txs {
                        if tx.tx_type() == X402_TX_TYPE {
                            shared.enroll(tx).await;
                        }
                    }
                }
                // The node closed the event stream.
                None => return,
            },
            () = cancel.cancelled() => return,
        }
    }
}

async fn broadcast_loop<N: NodeBackend>(
    shared: Arc<Shared<N>>,
    mut queue: mpsc::Receiver<Arc<PaymentEnvelope>>,
    cancel: CancellationToken,
) {
    let mut tick = interval_at(
        Instant::now() + REBROADCAST_INTERVAL,
        REBROADCAST_INTERVAL,
    );
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            tx = queue.recv() => match tx {
                Some(tx) => shared.broadcast(&tx).await,
                None => return,
            },
            _ = tick.tick() => shared.rebroadcast_pending().await,
            () = cancel.cancelled() => return,
        }
    }
}

async fn monitor_loop<N: NodeBackend>(shared: Arc<Shared<N>>, cancel: CancellationToken) {
    let mut tick = interval_at(Instant::now() + BLOCK_SCAN_INTERVAL, BLOCK_SCAN_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => shared.scan_recent_blocks().await,
            () = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, b256};
    use tokio::time::{advance, sleep};

    use crate::testutil::MockNode;

    fn envelope(nonce: u64) -> Arc<PaymentEnvelope> {
        Arc::new(PaymentEnvelope::x402(1776, nonce, Bytes::from(vec![nonce as u8])))
    }

    #[tokio::test]
    async fn non_x402_transactions_are_not_enrolled() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let foreign = Arc::new(PaymentEnvelope::foreign(0x02, B256::repeat_byte(1)));
        manager.enroll(foreign).await;
        assert_eq!(manager.pending_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enrolled_envelope_is_broadcast_promptly() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(1);
        manager.enroll(Arc::clone(&tx)).await;
        assert_eq!(manager.pending_count().await, 1);

        // Let the worker drain the queue without reaching the 5s tick.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(node.broadcasts(), vec![tx.hash()]);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn double_enrollment_broadcasts_once() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(2);
        manager.enroll(Arc::clone(&tx)).await;
        manager.enroll(Arc::clone(&tx)).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.pending_count().await, 1);
        assert_eq!(node.broadcasts().len(), 1);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_enrolls_x402_transactions_from_pool_events() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        sleep(Duration::from_millis(10)).await;

        let foreign = Arc::new(PaymentEnvelope::foreign(0x02, B256::repeat_byte(9)));
        let ours = envelope(3);
        node.send_new_txs(vec![foreign, Arc::clone(&ours)]);
        sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.pending_count().await, 1);
        assert_eq!(node.broadcasts(), vec![ours.hash()]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn rebroadcast_keeps_pooled_envelopes_and_retires_vanished_ones() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let pooled = envelope(4);
        let vanished = envelope(5);
        node.mempool_insert(pooled.hash());
        manager.enroll(Arc::clone(&pooled)).await;
        manager.enroll(Arc::clone(&vanished)).await;

        manager.rebroadcast_once().await;
        assert_eq!(manager.pending_count().await, 1);
        assert!(node.broadcasts().contains(&pooled.hash()));

        manager.rebroadcast_once().await;
        let count = node
            .broadcasts()
            .iter()
            .filter(|hash| **hash == pooled.hash())
            .count();
        assert!(count >= 2, "pooled envelope should be re-broadcast each tick");
        manager.stop().await;
    }

    #[tokio::test]
    async fn scan_retires_envelopes_found_in_recent_blocks() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(6);
        manager.enroll(Arc::clone(&tx)).await;

        node.push_block(vec![]);
        node.push_block(vec![tx.hash()]);
        node.push_block(vec![]);

        manager.scan_once().await;
        assert_eq!(manager.pending_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn scan_retires_vanished_envelopes_as_dropped() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(7);
        manager.enroll(Arc::clone(&tx)).await;
        node.push_block(vec![]);

        manager.scan_once().await;
        assert_eq!(manager.pending_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn scan_skips_envelopes_still_in_the_mempool() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(8);
        node.mempool_insert(tx.hash());
        manager.enroll(Arc::clone(&tx)).await;
        node.push_block(vec![]);

        manager.scan_once().await;
        assert_eq!(manager.pending_count().await, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn scan_without_a_head_block_leaves_envelopes_tracked() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(9);
        manager.enroll(Arc::clone(&tx)).await;

        manager.scan_once().await;
        assert_eq!(manager.pending_count().await, 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn inclusion_scan_looks_back_exactly_five_blocks() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let deep = b256!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let shallow = b256!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

        node.push_block(vec![deep]); // head - 5, out of range
        node.push_block(vec![shallow]); // head - 4, in range
        for _ in 0..4 {
            node.push_block(vec![]);
        }

        assert_eq!(manager.locate_in_recent_blocks(shallow).await, Some(1));
        assert_eq!(manager.locate_in_recent_blocks(deep).await, None);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tickers_drive_rebroadcast_and_retirement() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        let tx = envelope(10);
        node.mempool_insert(tx.hash());
        manager.enroll(Arc::clone(&tx)).await;
        sleep(Duration::from_millis(10)).await;
        let after_enroll = node.broadcasts().len();

        advance(REBROADCAST_INTERVAL + Duration::from_millis(10)).await;
        sleep(Duration::from_millis(10)).await;
        assert!(node.broadcasts().len() > after_enroll);

        node.mempool_remove(tx.hash());
        advance(REBROADCAST_INTERVAL).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.pending_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_joins_all_tasks_and_enrollment_still_tracks() {
        let node = Arc::new(MockNode::new());
        let manager = PropagationManager::start(Arc::clone(&node));
        manager.stop().await;

        // The queue consumer is gone, but tracking still works and the
        // envelope waits for an (absent) tick rather than being lost.
        let tx = envelope(11);
        manager.enroll(Arc::clone(&tx)).await;
        assert_eq!(manager.pending_count().await, 1);
    }
}
