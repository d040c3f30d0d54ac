//! Per-invocation transaction context

use crate::fuel::FuelMeter;
use crate::params::ChainParams;
use crate::storage::{Select, StorageSession, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The block an invocation runs inside, absent for out-of-block evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub block_id: i64,
    pub time: i64,
    pub key_id: i64,
    pub ecosystem_id: i64,
    pub node_position: i64,
}

/// Mutable state of one transaction execution
///
/// Created when the replay controller starts a transaction and dropped when
/// the transaction commits or is abandoned. Carries the declared-parameter
/// bindings, the fuel budget and the stack of in-flight contract names used
/// for diagnostics.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub tx_hash: Vec<u8>,
    pub tx_type: i64,
    pub time: i64,
    pub key_id: i64,
    pub ecosystem_id: i64,
    pub token_ecosystem: i64,
    /// Targeting a virtual dedicated ecosystem's private registry
    pub dedicated: bool,
    pub params: BTreeMap<String, Value>,
    /// Raw wire payload length, basis of the size-fuel charge
    pub payload_len: usize,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub fuel_override: Option<i64>,
    pub fuel: FuelMeter,
    pub stack: Vec<String>,
    pub block: Option<BlockContext>,
    /// Fuel consumed by the last completed contract call
    pub used_cost: i64,
}

impl TransactionContext {
    pub fn builder() -> TransactionContextBuilder {
        TransactionContextBuilder::new()
    }

    /// Resolve the fuel budget: transaction override first, then the
    /// ecosystem's `max_fuel` parameter row, then the chain default.
    pub fn init_fuel(
        &mut self,
        session: &dyn StorageSession,
        params: &ChainParams,
    ) {
        let table = format!("{}_parameters", self.ecosystem_id);
        let ecosystem_max = if session.has_table(&table) {
            session
                .query_row(
                    &Select::all(&table).filter("name", Value::Text("max_fuel".to_string())),
                )
                .ok()
                .flatten()
                .and_then(|row| row.get("value").and_then(Value::as_int))
        } else {
            None
        };
        self.fuel =
            FuelMeter::from_limits(self.fuel_override, ecosystem_max, params.default_fuel_limit);
    }

    /// Run `f` with `name` pushed on the call stack
    ///
    /// The frame is popped on every return path, so the stack stays
    /// balanced across nested contract calls that fail partway.
    pub fn with_frame<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.stack.push(name.to_string());
        let out = f(self);
        self.stack.pop();
        out
    }

    /// Human-readable call chain for diagnostics
    pub fn call_chain(&self) -> String {
        self.stack.join(" -> ")
    }

    pub fn block_id(&self) -> i64 {
        self.block.as_ref().map(|b| b.block_id).unwrap_or(0)
    }

    pub fn tx_hash_hex(&self) -> String {
        hex::encode(&self.tx_hash)
    }
}

/// Builder for transaction contexts
pub struct TransactionContextBuilder {
    tx_hash: Vec<u8>,
    tx_type: i64,
    time: i64,
    key_id: i64,
    ecosystem_id: i64,
    token_ecosystem: i64,
    dedicated: bool,
    params: BTreeMap<String, Value>,
    payload_len: usize,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    fuel_override: Option<i64>,
    fuel_limit: i64,
    block: Option<BlockContext>,
}

impl TransactionContextBuilder {
    pub fn new() -> Self {
        Self {
            tx_hash: Vec::new(),
            tx_type: 0,
            time: 0,
            key_id: 0,
            ecosystem_id: 0,
            token_ecosystem: 0,
            dedicated: false,
            params: BTreeMap::new(),
            payload_len: 0,
            public_key: Vec::new(),
            signature: Vec::new(),
            fuel_override: None,
            fuel_limit: 0,
            block: None,
        }
    }

    pub fn with_tx_hash(mut self, hash: Vec<u8>) -> Self {
        self.tx_hash = hash;
        self
    }

    pub fn with_tx_type(mut self, tx_type: i64) -> Self {
        self.tx_type = tx_type;
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn with_key_id(mut self, key_id: i64) -> Self {
        self.key_id = key_id;
        self
    }

    pub fn with_ecosystem(mut self, ecosystem_id: i64) -> Self {
        self.ecosystem_id = ecosystem_id;
        self
    }

    pub fn with_token_ecosystem(mut self, token_ecosystem: i64) -> Self {
        self.token_ecosystem = token_ecosystem;
        self
    }

    pub fn dedicated(mut self, dedicated: bool) -> Self {
        self.dedicated = dedicated;
        self
    }

    pub fn with_param(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    pub fn with_public_key(mut self, key: Vec<u8>) -> Self {
        self.public_key = key;
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_fuel_override(mut self, limit: i64) -> Self {
        self.fuel_override = Some(limit);
        self
    }

    pub fn with_fuel_limit(mut self, limit: i64) -> Self {
        self.fuel_limit = limit;
        self
    }

    pub fn with_block(mut self, block: BlockContext) -> Self {
        self.block = Some(block);
        self
    }

    pub fn build(self) -> TransactionContext {
        TransactionContext {
            tx_hash: self.tx_hash,
            tx_type: self.tx_type,
            time: self.time,
            key_id: self.key_id,
            ecosystem_id: self.ecosystem_id,
            token_ecosystem: self.token_ecosystem,
            dedicated: self.dedicated,
            params: self.params,
            payload_len: self.payload_len,
            public_key: self.public_key,
            signature: self.signature,
            fuel_override: self.fuel_override,
            fuel: FuelMeter::new(self.fuel_limit),
            stack: Vec::new(),
            block: self.block,
            used_cost: 0,
        }
    }
}

impl Default for TransactionContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
