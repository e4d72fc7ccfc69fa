//! Per-type capability records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Short string code naming the module that owns a transaction type
/// (`"cs"` for consensus, `"sc"` for contracts, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleCode(String);

impl ModuleCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ModuleCode {
    fn from(code: &str) -> Self {
        Self(code.to_string())
    }
}

impl From<String> for ModuleCode {
    fn from(code: String) -> Self {
        Self(code)
    }
}

impl fmt::Display for ModuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the pipeline needs to know about one transaction type.
///
/// Registered at runtime by the owning module. Every rule in validation,
/// packaging and block verification that differs between types is driven
/// by one of these flags, never by matching on the type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRegister {
    pub tx_type: u16,
    pub module: ModuleCode,
    /// Created by the chain itself (coinbase, punishments, contract
    /// refunds). Never accepted through external submission.
    pub system_tx: bool,
    /// May release previously locked funds.
    pub unlock_tx: bool,
    pub verify_signature: bool,
    pub verify_fee: bool,
    /// Input to the owning module's pack-produce hook.
    pub pack_produce: bool,
    /// Legs may reference other chains.
    pub cross_chain: bool,
    pub coin_data_required: bool,
    /// At most one per block.
    pub singleton: bool,
    /// Only ever emitted by the owning module while a block is assembled.
    pub module_generated: bool,
    /// Announce by hash only; peers pull the payload on demand.
    pub hash_only_forward: bool,
}

impl TxRegister {
    /// An ordinary user type: signed, fee-paying, with coin data.
    pub fn new(tx_type: u16, module: impl Into<ModuleCode>) -> Self {
        Self {
            tx_type,
            module: module.into(),
            system_tx: false,
            unlock_tx: false,
            verify_signature: true,
            verify_fee: true,
            pack_produce: false,
            cross_chain: false,
            coin_data_required: true,
            singleton: false,
            module_generated: false,
            hash_only_forward: false,
        }
    }

    /// A system type: unsigned, fee-free, coin data optional.
    pub fn system(tx_type: u16, module: impl Into<ModuleCode>) -> Self {
        Self {
            system_tx: true,
            verify_signature: false,
            verify_fee: false,
            coin_data_required: false,
            ..Self::new(tx_type, module)
        }
    }

    /// A system type the owning module emits during block assembly.
    pub fn generated(tx_type: u16, module: impl Into<ModuleCode>) -> Self {
        Self {
            module_generated: true,
            ..Self::system(tx_type, module)
        }
    }

    /// Whether external intake may accept this type.
    pub fn is_user_submittable(&self) -> bool {
        !self.system_tx && !self.module_generated
    }
}
