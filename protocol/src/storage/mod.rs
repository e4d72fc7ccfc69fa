//! # Storage Module
//!
//! ```text
//! tx_store.rs - TxStore trait, in-memory implementation, StoreError
//! db.rs       - sled persistence: tx trees, headers, best height
//! block.rs    - BlockHeader and the transaction Merkle root
//! ```
//!
//! The pipeline only ever sees `Arc<dyn TxStore>`. Whether a store lives in
//! memory or in a sled tree is the node's decision.

pub mod block;
pub mod db;
pub mod tx_store;

pub use block::BlockHeader;
pub use db::{KilnDB, SledTxStore};
pub use tx_store::{MemoryTxStore, StoreError, StoreResult, TxStore};
