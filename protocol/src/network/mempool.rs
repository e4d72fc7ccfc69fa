//! FIFO transaction pool.
//!
//! Thread-safe pool of admitted transactions awaiting block inclusion. Two
//! indices are kept:
//!
//! - a hash queue (`parking_lot::Mutex<VecDeque>`) fixing the order the
//!   packager drains in, and
//! - a record map (`DashMap`) holding the full transactions, for O(1)
//!   duplicate checks from the intake path.
//!
//! ## Design
//!
//! - [`Mempool::remove`] drops the record only. The hash stays queued as a
//!   placeholder until [`Mempool::poll`] reaches it and skips it, so the two
//!   sizes diverge transiently. This keeps block commits O(txs) instead of
//!   O(pool).
//! - Every queue slot carries the sequence number of the insertion that
//!   created it, and so does the record. A slot only yields its record when
//!   the numbers agree, so a transaction re-added after `remove` comes out
//!   at its new position, never at a stale placeholder's.
//! - Every mutation that touches both indices does so under the queue lock,
//!   so a concurrent `add` and `poll` can neither lose nor duplicate an
//!   entry. Reads of the record map never take the lock.
//! - [`Mempool::offer_first`] is the put-back path for transactions the
//!   packager already held. It bypasses the capacity check: those
//!   transactions were admitted once and must not be lost to a pool that
//!   filled up while they were out.

use std::collections::VecDeque;
use std::fmt;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::transaction::builder::Transaction;
use crate::transaction::types::TxHash;

/// Default pool capacity.
pub const DEFAULT_MEMPOOL_SIZE: usize = 100_000;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum number of transaction records the pool will hold.
    pub max_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MEMPOOL_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

/// Drain order. May contain slots whose record is gone or was re-added.
#[derive(Debug, Default)]
struct Queue {
    slots: VecDeque<(TxHash, u64)>,
    next_seq: u64,
}

impl Queue {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[derive(Debug)]
struct Record {
    tx: Transaction,
    seq: u64,
}

pub struct Mempool {
    queue: Mutex<Queue>,

    /// Full transactions by hash.
    records: DashMap<TxHash, Record>,

    config: MempoolConfig,
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("records", &self.records.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            records: DashMap::new(),
            config,
        }
    }

    /// Append a transaction. Returns `false` when the pool is full or the
    /// hash is already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        let hash = tx.hash();
        let mut queue = self.queue.lock();
        if self.records.contains_key(&hash) || self.records.len() >= self.config.max_size {
            return false;
        }
        let seq = queue.next_seq();
        self.records.insert(hash, Record { tx, seq });
        queue.slots.push_back((hash, seq));
        true
    }

    /// Take the oldest transaction, skipping placeholders left by
    /// [`remove`](Self::remove).
    pub fn poll(&self) -> Option<Transaction> {
        let mut queue = self.queue.lock();
        while let Some((hash, seq)) = queue.slots.pop_front() {
            if let Some((_, record)) = self.records.remove_if(&hash, |_, r| r.seq == seq) {
                return Some(record.tx);
            }
        }
        None
    }

    /// Put a transaction back at the front. No capacity check. A hash that
    /// is already pooled is left where it is.
    pub fn offer_first(&self, tx: Transaction) {
        let hash = tx.hash();
        let mut queue = self.queue.lock();
        if self.records.contains_key(&hash) {
            return;
        }
        let seq = queue.next_seq();
        self.records.insert(hash, Record { tx, seq });
        queue.slots.push_front((hash, seq));
    }

    /// Drop a transaction's record. Its queue slot is reclaimed lazily.
    pub fn remove(&self, hash: &TxHash) -> Option<Transaction> {
        self.records.remove(hash).map(|(_, record)| record.tx)
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.records.contains_key(hash)
    }

    /// Length of the hash queue, placeholders included.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().slots.len()
    }

    /// Number of transactions actually held.
    pub fn record_len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.slots.clear();
        self.records.clear();
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::builder::TransactionBuilder;
    use std::sync::Arc;
    use std::thread;

    fn tx(tag: u32) -> Transaction {
        TransactionBuilder::new(2)
            .time(1_700_000_000)
            .remark(tag.to_le_bytes().to_vec())
            .build()
    }

    fn pool(max_size: usize) -> Mempool {
        Mempool::new(MempoolConfig { max_size })
    }

    // -- add / poll ---------------------------------------------------------

    #[test]
    fn test_poll_is_fifo() {
        let pool = pool(10);
        let (a, b, c) = (tx(1), tx(2), tx(3));
        assert!(pool.add(a.clone()));
        assert!(pool.add(b.clone()));
        assert!(pool.add(c.clone()));

        assert_eq!(pool.poll(), Some(a));
        assert_eq!(pool.poll(), Some(b));
        assert_eq!(pool.poll(), Some(c));
        assert_eq!(pool.poll(), None);
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let pool = pool(10);
        assert!(pool.add(tx(1)));
        assert!(!pool.add(tx(1)));
        assert_eq!(pool.record_len(), 1);
        assert_eq!(pool.queue_len(), 1);
    }

    #[test]
    fn test_add_rejects_when_full() {
        let pool = pool(2);
        assert!(pool.add(tx(1)));
        assert!(pool.add(tx(2)));
        assert!(!pool.add(tx(3)));
        assert_eq!(pool.record_len(), 2);
    }

    // -- offer_first --------------------------------------------------------

    #[test]
    fn test_offer_first_jumps_the_queue() {
        let pool = pool(10);
        pool.add(tx(1));
        pool.offer_first(tx(2));
        assert_eq!(pool.poll(), Some(tx(2)));
        assert_eq!(pool.poll(), Some(tx(1)));
    }

    #[test]
    fn test_offer_first_ignores_capacity() {
        let pool = pool(1);
        pool.add(tx(1));
        pool.offer_first(tx(2));
        assert_eq!(pool.record_len(), 2);
    }

    #[test]
    fn test_offer_first_does_not_duplicate() {
        let pool = pool(10);
        pool.add(tx(1));
        pool.offer_first(tx(1));
        assert_eq!(pool.queue_len(), 1);
        assert_eq!(pool.poll(), Some(tx(1)));
        assert_eq!(pool.poll(), None);
    }

    #[test]
    fn test_descending_put_back_restores_order() {
        let pool = pool(10);
        let held = vec![(0usize, tx(10)), (1, tx(11)), (2, tx(12))];
        for (_, t) in held.iter().rev() {
            pool.offer_first(t.clone());
        }
        assert_eq!(pool.poll(), Some(tx(10)));
        assert_eq!(pool.poll(), Some(tx(11)));
        assert_eq!(pool.poll(), Some(tx(12)));
    }

    // -- remove -------------------------------------------------------------

    #[test]
    fn test_remove_leaves_placeholder() {
        let pool = pool(10);
        let (a, b) = (tx(1), tx(2));
        pool.add(a.clone());
        pool.add(b.clone());

        assert_eq!(pool.remove(&a.hash()), Some(a.clone()));
        assert_eq!(pool.record_len(), 1);
        assert_eq!(pool.queue_len(), 2);
        assert!(!pool.contains(&a.hash()));

        // The placeholder is skipped and reclaimed.
        assert_eq!(pool.poll(), Some(b));
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_readd_after_remove_goes_to_back() {
        let pool = pool(10);
        let (a, b) = (tx(1), tx(2));
        pool.add(a.clone());
        pool.add(b.clone());
        pool.remove(&a.hash());
        assert!(pool.add(a.clone()));
        assert_eq!(pool.queue_len(), 3);

        // The stale slot ahead of `b` is skipped; `a` keeps its new place.
        assert_eq!(pool.poll(), Some(b));
        assert_eq!(pool.poll(), Some(a));
        assert_eq!(pool.poll(), None);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_clear() {
        let pool = pool(10);
        pool.add(tx(1));
        pool.add(tx(2));
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.queue_len(), 0);
    }

    // -- Thread safety ------------------------------------------------------

    #[test]
    fn test_concurrent_add_and_poll_lose_nothing() {
        let pool = Arc::new(pool(100_000));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..250u32 {
                        assert!(pool.add(tx(p * 1_000 + i)));
                    }
                })
            })
            .collect();

        let consumer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let mut taken = Vec::new();
                for _ in 0..10_000 {
                    if let Some(t) = pool.poll() {
                        taken.push(t.hash());
                    }
                }
                taken
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        while let Some(t) = pool.poll() {
            seen.push(t.hash());
        }

        assert_eq!(seen.len(), 1_000);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 1_000);
    }
}
