//! Configured chain parameters consumed by the engine

use crate::error::{ChainError, ContractError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fuel the engine grants a transaction when neither the transaction nor
/// the ecosystem configures a limit.
pub const DEFAULT_FUEL_LIMIT: i64 = 10_000_000;

/// One validator node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub position: i64,
    pub key_id: i64,
    pub public: Vec<u8>,
}

/// Chain-wide configured parameters
///
/// The process loads these at startup and hands a reference to the replay
/// controller; the core never reads configuration ambiently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainParams {
    /// Fuel-to-currency rate per token ecosystem
    pub fuel_rates: HashMap<i64, i128>,
    /// Fuel charged per KiB of raw transaction payload
    pub size_fuel: i64,
    /// Commission percentage withheld from fee transfers
    pub commission_size: i64,
    /// Commission recipient per token ecosystem
    pub commission_wallets: HashMap<i64, i64>,
    /// Fuel granted when nothing else configures a limit
    pub default_fuel_limit: i64,
    /// Maximum number of blocks a fetch walk may roll back
    pub rollback_depth: i64,
    /// Known-bad block signatures, block id to hex signature
    pub bad_blocks: HashMap<i64, String>,
    /// Validator set
    pub nodes: Vec<NodeInfo>,
}

impl ChainParams {
    pub fn new() -> Self {
        Self {
            fuel_rates: HashMap::new(),
            size_fuel: 1,
            commission_size: 3,
            commission_wallets: HashMap::new(),
            default_fuel_limit: DEFAULT_FUEL_LIMIT,
            rollback_depth: 144,
            bad_blocks: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Fuel rate for a token ecosystem; must be configured and positive
    pub fn fuel_rate(&self, token_ecosystem: i64) -> Result<i128, ContractError> {
        match self.fuel_rates.get(&token_ecosystem) {
            Some(rate) if *rate > 0 => Ok(*rate),
            _ => Err(ContractError::BadFuelRate { token_ecosystem }),
        }
    }

    pub fn commission_wallet(&self, token_ecosystem: i64) -> Option<i64> {
        self.commission_wallets.get(&token_ecosystem).copied()
    }

    pub fn node_by_position(&self, position: i64) -> Result<&NodeInfo, ChainError> {
        self.nodes
            .iter()
            .find(|node| node.position == position)
            .ok_or(ChainError::UnknownNode { position })
    }

    pub fn node_by_key(&self, key_id: i64) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.key_id == key_id)
    }

    /// Whether the signature is the recorded poison-pill signature for the
    /// block id. Matching is by hex string, independent of cryptographic
    /// validity.
    pub fn is_bad_block(&self, block_id: i64, signature: &[u8]) -> bool {
        self.bad_blocks
            .get(&block_id)
            .map(|hex_sig| hex_sig == &hex::encode(signature))
            .unwrap_or(false)
    }
}
