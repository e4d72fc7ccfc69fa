//! # KilnDB: Persistent Storage
//!
//! sled-backed persistence for a single chain.
//!
//! ## Tree Layout
//!
//! | Tree              | Key                | Value                    |
//! |-------------------|--------------------|--------------------------|
//! | `unconfirmed_txs` | tx hash (32B)      | `bincode(Transaction)`   |
//! | `confirmed_txs`   | tx hash (32B)      | `bincode(Transaction)`   |
//! | `headers`         | `height` (8B BE)   | `bincode(BlockHeader)`   |
//! | `metadata`        | key (UTF-8)        | value (bytes)            |
//!
//! Heights are big-endian so sled's lexicographic order is numeric order.
//! Each tx tree is exposed as a [`SledTxStore`], which is what the chain
//! context actually holds.

use sled::{Db, Tree};
use std::path::Path;

use super::block::BlockHeader;
use super::tx_store::{StoreError, StoreResult, TxStore};
use crate::transaction::builder::Transaction;
use crate::transaction::types::TxHash;

const META_BEST_HEIGHT: &[u8] = b"best_height";

// ---------------------------------------------------------------------------
// SledTxStore
// ---------------------------------------------------------------------------

/// A [`TxStore`] over one sled tree.
#[derive(Debug, Clone)]
pub struct SledTxStore {
    tree: Tree,
}

impl SledTxStore {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Every stored transaction, in hash order. Used to rebuild the
    /// mempool after a restart.
    pub fn load_all(&self) -> StoreResult<Vec<Transaction>> {
        self.tree
            .iter()
            .values()
            .map(|value| {
                let bytes = value?;
                bincode::deserialize(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

impl TxStore for SledTxStore {
    fn exists(&self, hash: &TxHash) -> StoreResult<bool> {
        Ok(self.tree.contains_key(hash.as_bytes())?)
    }

    fn get(&self, hash: &TxHash) -> StoreResult<Option<Transaction>> {
        match self.tree.get(hash.as_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, tx: &Transaction) -> StoreResult<()> {
        let bytes = bincode::serialize(tx).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.tree.insert(tx.hash().as_bytes(), bytes)?;
        Ok(())
    }

    fn remove(&self, hash: &TxHash) -> StoreResult<()> {
        self.tree.remove(hash.as_bytes())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KilnDB
// ---------------------------------------------------------------------------

/// Persistent storage for one chain.
///
/// sled trees are safe to share across threads, so `KilnDB` is `Clone` and
/// cheap to hand around.
#[derive(Debug, Clone)]
pub struct KilnDB {
    db: Db,
    unconfirmed: SledTxStore,
    confirmed: SledTxStore,
    headers: Tree,
    metadata: Tree,
}

impl KilnDB {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            unconfirmed: SledTxStore::new(db.open_tree("unconfirmed_txs")?),
            confirmed: SledTxStore::new(db.open_tree("confirmed_txs")?),
            headers: db.open_tree("headers")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    pub fn unconfirmed(&self) -> SledTxStore {
        self.unconfirmed.clone()
    }

    pub fn confirmed(&self) -> SledTxStore {
        self.confirmed.clone()
    }

    /// Persist a block header and advance the best height.
    pub fn put_header(&self, header: &BlockHeader) -> StoreResult<()> {
        let key = header.height.to_be_bytes();
        let bytes =
            bincode::serialize(header).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.headers.insert(key, bytes)?;
        self.metadata.insert(META_BEST_HEIGHT, &key)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_header(&self, height: u64) -> StoreResult<Option<BlockHeader>> {
        match self.headers.get(height.to_be_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Flush every tree to disk. Returns the number of bytes written.
    pub fn flush(&self) -> StoreResult<usize> {
        Ok(self.db.flush()?)
    }

    /// Height of the last persisted header, 0 for an empty database.
    pub fn best_height(&self) -> StoreResult<u64> {
        match self.metadata.get(META_BEST_HEIGHT)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("corrupt best height".to_string()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::builder::TransactionBuilder;

    #[test]
    fn test_tx_trees_are_independent() {
        let db = KilnDB::open_temporary().unwrap();
        let tx = TransactionBuilder::new(2).time(1).build();
        db.unconfirmed().put(&tx).unwrap();

        assert!(db.unconfirmed().exists(&tx.hash()).unwrap());
        assert!(!db.confirmed().exists(&tx.hash()).unwrap());
        assert_eq!(db.unconfirmed().get(&tx.hash()).unwrap(), Some(tx.clone()));
        assert_eq!(db.unconfirmed().load_all().unwrap(), vec![tx.clone()]);

        db.unconfirmed().remove(&tx.hash()).unwrap();
        assert!(db.unconfirmed().is_empty());
    }

    #[test]
    fn test_best_height_tracks_headers() {
        let db = KilnDB::open_temporary().unwrap();
        assert_eq!(db.best_height().unwrap(), 0);

        let header = BlockHeader::new(7, [1u8; 32], 1_700_000_000, "packer".into(), None, &[]);
        db.put_header(&header).unwrap();
        assert_eq!(db.best_height().unwrap(), 7);
        assert_eq!(db.get_header(7).unwrap(), Some(header));
        assert_eq!(db.get_header(8).unwrap(), None);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let tx = TransactionBuilder::new(2).time(1).build();
        {
            let db = KilnDB::open(dir.path()).unwrap();
            db.confirmed().put(&tx).unwrap();
            db.put_header(&BlockHeader::new(3, [0u8; 32], 1, "p".into(), None, &[]))
                .unwrap();
        }
        let db = KilnDB::open(dir.path()).unwrap();
        assert!(db.confirmed().exists(&tx.hash()).unwrap());
        assert_eq!(db.best_height().unwrap(), 3);
    }
}
