//! Hash-keyed transaction stores.
//!
//! A chain keeps two: the unconfirmed store (admitted, not yet in a block)
//! and the confirmed store. Both are plain `exists/get/put/remove` maps;
//! the pipeline decides what moves between them and when.

use dashmap::DashMap;
use thiserror::Error;

use crate::transaction::builder::Transaction;
use crate::transaction::types::TxHash;

/// Errors from a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A transaction store keyed by hash.
pub trait TxStore: Send + Sync {
    fn exists(&self, hash: &TxHash) -> StoreResult<bool>;
    fn get(&self, hash: &TxHash) -> StoreResult<Option<Transaction>>;
    fn put(&self, tx: &Transaction) -> StoreResult<()>;
    /// Removing an absent hash is not an error.
    fn remove(&self, hash: &TxHash) -> StoreResult<()>;
}

/// Volatile store for tests and nodes that do not need to survive a
/// restart.
#[derive(Debug, Default)]
pub struct MemoryTxStore {
    txs: DashMap<TxHash, Transaction>,
}

impl MemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

impl TxStore for MemoryTxStore {
    fn exists(&self, hash: &TxHash) -> StoreResult<bool> {
        Ok(self.txs.contains_key(hash))
    }

    fn get(&self, hash: &TxHash) -> StoreResult<Option<Transaction>> {
        Ok(self.txs.get(hash).map(|e| e.value().clone()))
    }

    fn put(&self, tx: &Transaction) -> StoreResult<()> {
        self.txs.insert(tx.hash(), tx.clone());
        Ok(())
    }

    fn remove(&self, hash: &TxHash) -> StoreResult<()> {
        self.txs.remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::builder::TransactionBuilder;

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryTxStore::new();
        let tx = TransactionBuilder::new(2).time(5).build();
        assert!(!store.exists(&tx.hash()).unwrap());

        store.put(&tx).unwrap();
        assert!(store.exists(&tx.hash()).unwrap());
        assert_eq!(store.get(&tx.hash()).unwrap(), Some(tx.clone()));
        assert_eq!(store.len(), 1);

        store.remove(&tx.hash()).unwrap();
        store.remove(&tx.hash()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get(&tx.hash()).unwrap(), None);
    }
}
