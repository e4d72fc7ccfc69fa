//! # Network Module
//!
//! The per-chain transaction pipeline: intake, pooling, packaging and
//! verification of peer blocks.
//!
//! ## Architecture
//!
//! ```text
//! context.rs        - ChainContext: per-chain state, clock, control flags
//! mempool.rs        - FIFO pool with front put-back
//! orphan.rs         - bounded orphan retry counters
//! gossip.rs         - Network trait, loopback transport, recent-hash filter
//! intake.rs         - TxService: submit, peer relay, block commit
//! producer.rs       - BlockPackager: deadline-bound block assembly
//! block_verifier.rs - BlockVerifier: trust-nothing peer block checks
//! error.rs          - intake error taxonomy
//! ```
//!
//! ## Locking
//!
//! - The mempool locks internally and is never held across a collaborator
//!   call, so intake keeps adding while a block is assembled.
//! - Packaging and block verification share one ledger batch session and
//!   are serialized by the context's package lock.

pub mod block_verifier;
pub mod context;
pub mod error;
pub mod gossip;
pub mod intake;
pub mod mempool;
pub mod orphan;
pub mod producer;

pub use block_verifier::{BlockVerifier, BlockVerifyError};
pub use context::{
    ChainContext, ChainContextBuilder, Clock, ContextError, ManualClock, ProtocolSignal,
    SystemClock,
};
pub use error::{SubmitOutcome, TxError};
pub use gossip::{broadcast_with_retry, LoopbackNetwork, Network, NetworkError, RecentTxFilter};
pub use intake::TxService;
pub use mempool::{Mempool, MempoolConfig};
pub use orphan::{OrphanDecision, OrphanTracker};
pub use producer::{
    BlockPackager, EmptyReason, PackOutcome, PackageError, PackageRequest, PackageWrapper,
    PackedBlock,
};
