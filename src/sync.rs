//! Advisory sync monitoring.
//!
//! Settlement does not gate on sync state; this monitor exists so operators
//! (and health endpoints) can see when envelope propagation is likely to
//! stall: no chain head, no peers, or a head that has not advanced for too
//! long. Consecutive issues are counted and the counter resets once a check
//! passes again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::node::NodeBackend;
use crate::timestamp::UnixTimestamp;

/// Maximum tolerated age of the head block before the node counts as
/// out of sync.
pub const MAX_HEAD_AGE_SECONDS: u64 = 30;

/// A reason the node looks out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SyncIssue {
    #[error("no current block available")]
    NoCurrentBlock,
    #[error("no peers connected")]
    NoPeers,
    #[error("node appears to be out of sync")]
    StaleHead { head_age_seconds: u64 },
}

/// Periodically consulted health probe over the node backend.
#[derive(Debug)]
pub struct SyncMonitor<N: NodeBackend> {
    backend: Arc<N>,
    issues: AtomicU32,
}

impl<N: NodeBackend> SyncMonitor<N> {
    pub fn new(backend: Arc<N>) -> Self {
        Self {
            backend,
            issues: AtomicU32::new(0),
        }
    }

    /// Checks head presence, peer connectivity, and head freshness.
    pub async fn check_sync_status(&self) -> Result<(), SyncIssue> {
        let Some(head) = self.backend.current_block().await else {
            return Err(SyncIssue::NoCurrentBlock);
        };
        if self.backend.peer_count() == 0 {
            self.issues.fetch_add(1, Ordering::SeqCst);
            return Err(SyncIssue::NoPeers);
        }
        let now = UnixTimestamp::now().seconds_since_epoch();
        let head_age_seconds = now.saturating_sub(head.timestamp);
        if head_age_seconds > MAX_HEAD_AGE_SECONDS {
            self.issues.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                head_age_seconds,
                block = head.number,
                "node may be out of sync"
            );
            return Err(SyncIssue::StaleHead { head_age_seconds });
        }
        let previous = self.issues.swap(0, Ordering::SeqCst);
        if previous > 0 {
            tracing::info!(previous_issues = previous, "sync status recovered");
        }
        Ok(())
    }

    /// Number of consecutive failed checks.
    pub fn sync_issues(&self) -> u32 {
        self.issues.load(Ordering::SeqCst)
    }
}
