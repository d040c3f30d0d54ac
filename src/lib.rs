//! Deterministic State-Transition Engine (DSTE)
//!
//! The state-transition core of a permissioned ledger: contract programs
//! run under metered fuel, every mutation is journaled with its pre-image,
//! and any transaction or block range can be rolled back byte for byte.

pub mod access;
pub mod builtins;
pub mod context;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod fuel;
pub mod journal;
pub mod logging;
pub mod memstore;
pub mod params;
pub mod program;
pub mod replay;
pub mod storage;
pub mod wire;

// Re-export core types and traits
pub use access::{AccessEvaluator, ConditionCompiler, EvalScope, Predicate};
pub use context::{BlockContext, TransactionContext, TransactionContextBuilder};
pub use engine::{
    bind_wire_params, ContractEngine, Environment, SignatureVerifier, CALL_ACTION,
    CALL_CONDITIONS, CALL_INIT, CALL_ROLLBACK,
};
pub use error::{
    AccessError, ChainError, ContractError, EngineError, HashError, JournalError, ResourceError,
    StorageError, WireError,
};
pub use fingerprint::{Digest, Fingerprinter, HashProvider};
pub use fuel::FuelMeter;
pub use journal::{
    log_and_write, prune_before, undo_block, undo_block_range, undo_row, undo_transaction,
    PreImage,
};
pub use logging::{record_tx_error, tx_status, AuditLog, LogEntry, LogLevel};
pub use memstore::{bootstrap_ecosystem, bootstrap_system_tables, MemoryStorage};
pub use params::{ChainParams, NodeInfo, DEFAULT_FUEL_LIMIT};
pub use program::{
    ContractCompiler, ContractProgram, ParamSpec, ParamTags, ParamType, Phase, PhaseCode,
    PhaseTable, ProgramOwner, ProgramRegistry,
};
pub use replay::{BlockFetcher, ReplayController, SessionFactory};
pub use storage::{
    Assignment, AssignOp, ColumnKind, ColumnMeta, Row, Select, Statement, StorageSession, Value,
};
pub use wire::{
    encode_block, parse_block, BlockHeader, ParsedTransaction, TX_TYPE_CONTRACT,
    TX_TYPE_VALIDATOR_UPDATE,
};
