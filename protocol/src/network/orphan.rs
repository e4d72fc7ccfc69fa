//! Bounded orphan retry tracking.
//!
//! A transaction the ledger reports as an orphan may become valid once its
//! predecessor arrives, so the packager puts it back into the mempool.
//! Not forever: each counted orphan result increments a per-hash counter,
//! and once the counter exceeds the configured maximum the hash is evicted
//! and the transaction discarded for good.
//!
//! ## Counting policy
//!
//! Only orphans from the first ledger pass of a packaging attempt count.
//! Orphans that surface in a re-verification round, after module or
//! side-effect rejections rolled some transactions back, are a consequence
//! of those rollbacks rather than of the transaction itself; they go
//! through [`OrphanTracker::record_no_count`] and are always requeued.

use dashmap::DashMap;

use crate::transaction::types::TxHash;

/// What to do with an orphaned transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanDecision {
    /// Put it back into the mempool.
    Requeue,
    /// Retry budget exhausted; drop it with rollback.
    Discard,
}

/// Per-hash orphan counters for one chain.
#[derive(Debug)]
pub struct OrphanTracker {
    counts: DashMap<TxHash, u32>,
    max_retries: u32,
}

impl OrphanTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            counts: DashMap::new(),
            max_retries,
        }
    }

    /// Count one orphan result for `hash`.
    pub fn record(&self, hash: TxHash) -> OrphanDecision {
        let mut count = self.counts.entry(hash).or_insert(0);
        *count += 1;
        if *count > self.max_retries {
            drop(count);
            self.counts.remove(&hash);
            OrphanDecision::Discard
        } else {
            OrphanDecision::Requeue
        }
    }

    /// A rollback-induced orphan. Never counts.
    pub fn record_no_count(&self, _hash: TxHash) -> OrphanDecision {
        OrphanDecision::Requeue
    }

    /// Forget `hash`, e.g. once it is packed, confirmed or discarded.
    pub fn clear(&self, hash: &TxHash) {
        self.counts.remove(hash);
    }

    pub fn count(&self, hash: &TxHash) -> u32 {
        self.counts.get(hash).map_or(0, |c| *c)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
