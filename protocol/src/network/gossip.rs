//! # Transaction Propagation
//!
//! The pipeline's view of the peer-to-peer layer: a [`Network`] that can
//! broadcast a full transaction or announce only its hash. Transport
//! mechanics live behind the trait.
//!
//! ## Deduplication
//!
//! Self-originated transactions come back from peers as rebroadcasts.
//! [`RecentTxFilter`] remembers recently handled hashes for a short TTL so
//! those echoes are dropped without re-running validation. The filter is
//! bounded; past capacity the expired entries go first, then the oldest,
//! until it is back to 75%.
//!
//! ## Retry
//!
//! [`broadcast_with_retry`] makes a fixed number of attempts with a fixed
//! backoff. A transaction that fails every attempt stays admitted; peers
//! will pull it when it shows up in a block.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transaction::builder::Transaction;
use crate::transaction::types::TxHash;

/// Transport faults. A peer set that simply did not take the message is
/// `Ok(false)`, not an error.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound propagation.
pub trait Network: Send + Sync {
    fn broadcast(&self, tx: &Transaction) -> Result<bool, NetworkError>;

    /// Announce a hash only; peers fetch the payload if they want it.
    fn forward_hash_only(&self, hash: &TxHash) -> Result<bool, NetworkError>;
}

// ---------------------------------------------------------------------------
// LoopbackNetwork
// ---------------------------------------------------------------------------

/// A [`Network`] with no peers. Records what it was asked to send, which
/// is what a node without a transport and the test suites need.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    broadcasts: Mutex<Vec<TxHash>>,
    forwarded: Mutex<Vec<TxHash>>,
    /// Broadcast calls still to answer with `Ok(false)`.
    failures_left: AtomicU32,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A loopback whose first `failures` broadcasts are refused.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    pub fn broadcasts(&self) -> Vec<TxHash> {
        self.broadcasts.lock().clone()
    }

    pub fn forwarded(&self) -> Vec<TxHash> {
        self.forwarded.lock().clone()
    }
}

impl Network for LoopbackNetwork {
    fn broadcast(&self, tx: &Transaction) -> Result<bool, NetworkError> {
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Ok(false);
        }
        self.broadcasts.lock().push(tx.hash());
        Ok(true)
    }

    fn forward_hash_only(&self, hash: &TxHash) -> Result<bool, NetworkError> {
        self.forwarded.lock().push(*hash);
        Ok(true)
    }
}

/// Broadcast `tx`, retrying up to `attempts` times with `backoff` between
/// tries. Returns whether any attempt succeeded.
pub fn broadcast_with_retry(
    network: &dyn Network,
    tx: &Transaction,
    attempts: u32,
    backoff: Duration,
) -> bool {
    for attempt in 1..=attempts {
        match network.broadcast(tx) {
            Ok(true) => {
                debug!(tx_hash = %tx.hash(), attempt, "transaction broadcast");
                return true;
            }
            Ok(false) => {
                debug!(tx_hash = %tx.hash(), attempt, "broadcast not accepted by peers");
            }
            Err(e) => {
                warn!(tx_hash = %tx.hash(), attempt, error = %e, "broadcast failed");
            }
        }
        if attempt < attempts && !backoff.is_zero() {
            std::thread::sleep(backoff);
        }
    }
    false
}

// ---------------------------------------------------------------------------
// RecentTxFilter
// ---------------------------------------------------------------------------

/// Short-lived set of recently handled transaction hashes.
///
/// Times are Unix milliseconds supplied by the caller, so the filter
/// follows whatever clock the chain context runs on.
#[derive(Debug)]
pub struct RecentTxFilter {
    /// Hash to expiry time.
    entries: DashMap<TxHash, u64>,
    ttl_ms: u64,
    capacity: usize,
}

impl RecentTxFilter {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: ttl.as_millis() as u64,
            capacity,
        }
    }

    pub fn insert(&self, hash: TxHash, now_ms: u64) {
        self.entries.insert(hash, now_ms.saturating_add(self.ttl_ms));
        self.maybe_evict(now_ms);
    }

    /// Whether `hash` was recorded and has not expired.
    pub fn contains(&self, hash: &TxHash, now_ms: u64) -> bool {
        self.entries.get(hash).map_or(false, |expiry| *expiry > now_ms)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_evict(&self, now_ms: u64) {
        if self.entries.len() <= self.capacity {
            return;
        }
        self.entries.retain(|_, expiry| *expiry > now_ms);
        if self.entries.len() <= self.capacity {
            return;
        }

        let target = self.capacity * 3 / 4;
        let mut entries: Vec<(TxHash, u64)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, expiry)| *expiry);

        let to_remove = entries.len().saturating_sub(target);
        for (hash, _) in entries.iter().take(to_remove) {
            self.entries.remove(hash);
        }
    }
}
