//! # Transaction Type Registry
//!
//! Modules (consensus, contracts, cross-chain, ...) are deployed
//! independently of this pipeline. At startup, and whenever one is
//! upgraded, a module registers the transaction types it owns together
//! with a [`ModuleHandler`]: the hooks the packager and verifier call to
//! run the module's own business rules.
//!
//! Dispatch is a table lookup, type code to [`TxRegister`] and module code
//! to handler. There is no trait per transaction type.
//!
//! ## Hooks
//!
//! - `validate`: the module's unified validator over every transaction it
//!   owns in a block; returns the hashes it rejects.
//! - `execute`: side-effect execution (contract VM, DEX matching). Threads
//!   the block's state root and may emit follow-up transactions or reject
//!   inputs. Modules without side effects return `None`.
//! - `pack_produce`: rewrites a module's inputs into generated
//!   transactions while the block is assembled, and reproduces that
//!   rewrite when a peer's block is verified.

pub mod register;

pub use register::{ModuleCode, TxRegister};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::transaction::types::{tx_types, TxHash};

/// Failure of a module hook itself, as opposed to a module rejecting a
/// transaction. Aborts the packaging attempt or block verification.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {0} is unavailable")]
    Unavailable(ModuleCode),

    #[error("module {module} failed: {reason}")]
    Failed { module: ModuleCode, reason: String },
}

/// Block-level facts handed to every hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u64,
    /// Unix seconds.
    pub block_time: u64,
    pub pre_state_root: [u8; 32],
}

/// Whether `pack_produce` is assembling a block or checking one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducePhase {
    Package,
    Verify,
}

/// Result of a `pack_produce` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceOutcome {
    /// Wire forms of newly generated transactions.
    pub generated: Vec<Vec<u8>>,
    /// Inputs consumed into the generated transactions.
    pub removed: Vec<TxHash>,
}

/// Result of an `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub state_root: [u8; 32],
    pub generated: Vec<Vec<u8>>,
    pub rejected: Vec<TxHash>,
}

/// Hooks one module exposes to the pipeline. Implementations are usually
/// RPC clients to the module process.
pub trait ModuleHandler: Send + Sync {
    /// Validate the module's transactions as a group. An empty vector means
    /// all pass.
    fn validate(&self, txs: &[Vec<u8>], ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError>;

    fn pack_produce(
        &self,
        _txs: &[Vec<u8>],
        _ctx: &BlockContext,
        _phase: ProducePhase,
    ) -> Result<ProduceOutcome, ModuleError> {
        Ok(ProduceOutcome::default())
    }

    /// Execute side effects starting from `state_root`.
    fn execute(
        &self,
        _txs: &[Vec<u8>],
        _ctx: &BlockContext,
        _state_root: [u8; 32],
    ) -> Result<Option<ExecutionOutcome>, ModuleError> {
        Ok(None)
    }
}

/// Serialized transactions grouped by owning module. Ordered, so hooks run
/// in the same module order on every node.
pub type ModuleVerifyMap = BTreeMap<ModuleCode, Vec<Vec<u8>>>;

/// Aggregate of every module's `execute` results for one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// `None` when no module produced side effects.
    pub state_root: Option<[u8; 32]>,
    pub generated: Vec<Vec<u8>>,
    pub rejected: Vec<TxHash>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Runtime table of transaction types and module handlers.
#[derive(Default)]
pub struct Registry {
    types: DashMap<u16, TxRegister>,
    handlers: DashMap<ModuleCode, Arc<dyn ModuleHandler>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.types.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the types every chain has.
    pub fn with_builtin_types() -> Self {
        let registry = Self::new();
        registry.register_builtin_types();
        registry
    }

    /// Coinbase (system, singleton, consensus-owned) and plain transfers.
    pub fn register_builtin_types(&self) {
        let coinbase = TxRegister {
            singleton: true,
            ..TxRegister::system(tx_types::COIN_BASE, crate::config::MODULE_CONSENSUS)
        };
        self.register_type(coinbase);
        self.register_type(TxRegister::new(
            tx_types::TRANSFER,
            crate::config::MODULE_TRANSACTION,
        ));
    }

    /// Register a type without a handler. Its module's group is skipped
    /// by module validation until a handler shows up.
    pub fn register_type(&self, register: TxRegister) {
        self.types.insert(register.tx_type, register);
    }

    /// Register a module's types and hooks in one go. The registers' module
    /// codes are forced to `code`.
    pub fn register_module(
        &self,
        code: impl Into<ModuleCode>,
        registers: Vec<TxRegister>,
        handler: Arc<dyn ModuleHandler>,
    ) {
        let code = code.into();
        let count = registers.len();
        for mut register in registers {
            register.module = code.clone();
            self.types.insert(register.tx_type, register);
        }
        self.handlers.insert(code.clone(), handler);
        info!(module = %code, types = count, "module registered");
    }

    /// Remove a module's handler and every type it owns. Returns the number
    /// of types removed.
    pub fn deregister_module(&self, code: &ModuleCode) -> usize {
        self.handlers.remove(code);
        let before = self.types.len();
        self.types.retain(|_, register| &register.module != code);
        let removed = before - self.types.len();
        info!(module = %code, types = removed, "module deregistered");
        removed
    }

    pub fn get(&self, tx_type: u16) -> Option<TxRegister> {
        self.types.get(&tx_type).map(|r| r.value().clone())
    }

    pub fn handler(&self, code: &ModuleCode) -> Option<Arc<dyn ModuleHandler>> {
        self.handlers.get(code).map(|h| Arc::clone(h.value()))
    }

    /// Type codes owned by `code`, ascending.
    pub fn types_of(&self, code: &ModuleCode) -> Vec<u16> {
        let mut types: Vec<u16> = self
            .types
            .iter()
            .filter(|r| &r.value().module == code)
            .map(|r| *r.key())
            .collect();
        types.sort_unstable();
        types
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    // -- Dispatch -------------------------------------------------------------

    /// Run every module's unified validator over its group and collect the
    /// rejected hashes.
    pub fn validate_groups(
        &self,
        groups: &ModuleVerifyMap,
        ctx: &BlockContext,
    ) -> Result<Vec<TxHash>, ModuleError> {
        let mut rejected = Vec::new();
        for (code, txs) in groups {
            let Some(handler) = self.handler(code) else {
                debug!(module = %code, count = txs.len(), "no validator registered, skipping group");
                continue;
            };
            let module_rejected = handler.validate(txs, ctx)?;
            if !module_rejected.is_empty() {
                debug!(module = %code, rejected = module_rejected.len(), "module rejected transactions");
            }
            rejected.extend(module_rejected);
        }
        Ok(rejected)
    }

    /// Run side-effect execution module by module, threading the state root
    /// from `ctx.pre_state_root`.
    pub fn execute_groups(
        &self,
        groups: &ModuleVerifyMap,
        ctx: &BlockContext,
    ) -> Result<ExecutionSummary, ModuleError> {
        let mut summary = ExecutionSummary::default();
        let mut root = ctx.pre_state_root;
        for (code, txs) in groups {
            let Some(handler) = self.handler(code) else {
                continue;
            };
            if let Some(outcome) = handler.execute(txs, ctx, root)? {
                root = outcome.state_root;
                summary.state_root = Some(root);
                summary.generated.extend(outcome.generated);
                summary.rejected.extend(outcome.rejected);
            }
        }
        Ok(summary)
    }

    /// Call `pack_produce` for every group, merging the outcomes.
    pub fn produce_groups(
        &self,
        groups: &ModuleVerifyMap,
        ctx: &BlockContext,
        phase: ProducePhase,
    ) -> Result<ProduceOutcome, ModuleError> {
        let mut merged = ProduceOutcome::default();
        for (code, txs) in groups {
            let handler = self
                .handler(code)
                .ok_or_else(|| ModuleError::Unavailable(code.clone()))?;
            let outcome = handler.pack_produce(txs, ctx, phase)?;
            merged.generated.extend(outcome.generated);
            merged.removed.extend(outcome.removed);
        }
        Ok(merged)
    }
}
