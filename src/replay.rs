//! In-memory replay protection for payment nonces.
//!
//! Tracks which `(payer, nonce)` pairs have been claimed during this process
//! lifetime. Not durable across restarts. Entries are never evicted; the
//! first-seen timestamp is recorded as the hook for a future TTL policy.

use alloy_primitives::{Address, B256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::timestamp::UnixTimestamp;

/// Process-wide `payer -> nonce -> first-seen-seconds` map behind a single
/// mutex. Every critical section is O(1).
#[derive(Debug, Default)]
pub struct ReplayGuard {
    used: Mutex<HashMap<Address, HashMap<B256, u64>>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advisory membership test. Used by the verifier to reject obvious
    /// replays early; the settlement path must still [`claim`](Self::claim).
    pub fn is_used(&self, from: Address, nonce: B256) -> bool {
        let used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.get(&from).is_some_and(|by_from| by_from.contains_key(&nonce))
    }

    /// Atomic test-and-set. Returns `true` when the pair was already
    /// claimed (claim denied), `false` when it was newly inserted.
    ///
    /// This is the single linearization point preventing double settlement.
    /// Claims are never rolled back, even if later settlement steps fail.
    pub fn claim(&self, from: Address, nonce: B256) -> bool {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let by_from = used.entry(from).or_default();
        if by_from.contains_key(&nonce) {
            return true;
        }
        by_from.insert(nonce, UnixTimestamp::now().seconds_since_epoch());
        false
    }

    /// When the pair was first claimed, in Unix seconds.
    pub fn first_seen(&self, from: Address, nonce: B256) -> Option<u64> {
        let used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.get(&from).and_then(|by_from| by_from.get(&nonce)).copied()
    }
}
