//! Error types for the DSTE

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl EngineError {
    /// Whether the undo machinery itself failed. The ledger cannot be
    /// trusted after this and block application must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Journal(JournalError::RollbackFailed { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Access denied: {subject}")]
    Denied { subject: String },

    #[error("No condition stored for {name}")]
    MissingCondition { name: String },

    #[error("Condition evaluation failed: {reason}")]
    Eval { reason: String },
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Contract not found: {name} in ecosystem {ecosystem_id}")]
    NotFound { name: String, ecosystem_id: i64 },

    #[error("Invalid parameter {field}: {reason}")]
    Parameter { field: String, reason: String },

    #[error("Incorrect signature")]
    InvalidSignature,

    #[error("Empty public key for account {key_id}")]
    MissingPublicKey { key_id: i64 },

    #[error("Current balance is not enough")]
    InsufficientFunds,

    #[error("Token and user public keys are different")]
    KeyMismatch,

    #[error("Fuel rate must be greater than 0 for ecosystem {token_ecosystem}")]
    BadFuelRate { token_ecosystem: i64 },

    #[error("Wrong result type of price function")]
    BadPriceResult,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Rollback record {rb_id} does not exist")]
    RecordNotFound { rb_id: i64 },

    #[error("Cannot write with general rollback outside a block")]
    BlockRequired,

    #[error("Rollback failed: {reason}")]
    RollbackFailed { reason: String },

    #[error("Corrupt rollback record {rb_id}: {reason}")]
    Corrupt { rb_id: i64, reason: String },
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Transaction {hash} already recorded")]
    DuplicateTransaction { hash: String },

    #[error("Header hash mismatch in block {block_id}")]
    HeaderMismatch { block_id: i64 },

    #[error("Bad block signature in block {block_id}")]
    BadSignature { block_id: i64 },

    #[error("Block {block_id} is denylisted")]
    Denylisted { block_id: i64 },

    #[error("Block id {header} does not match requested {requested}")]
    BlockIdMismatch { header: i64, requested: i64 },

    #[error("Rollback walk would go below block 2")]
    BelowGenesis,

    #[error("Rollback depth {depth} exceeded")]
    DepthExceeded { depth: i64 },

    #[error("Unknown validator position {position}")]
    UnknownNode { position: i64 },

    #[error("Block fetch failed: {reason}")]
    Fetch { reason: String },

    #[error("Another replay is in progress")]
    ReplayBusy,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },

    #[error("Table {table} does not exist")]
    MissingTable { table: String },

    #[error("Column {column} does not exist in {table}")]
    MissingColumn { table: String, column: String },

    #[error("Value in column {column} is not usable as {expected}")]
    BadValue { column: String, expected: String },
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Fuel exhausted: needed {needed}, remaining {remaining}")]
    FuelExhausted { needed: i64, remaining: i64 },

    #[error("Value for {column} cannot be larger than 64 bytes")]
    OversizedField { column: String },
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Hash provider is not configured")]
    ProviderUnset,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Input ended inside a length prefix")]
    TruncatedLength,

    #[error("Input ended inside a field of {expected} bytes")]
    TruncatedField { expected: usize },

    #[error("Length prefix {length} exceeds remaining input")]
    LengthOverrun { length: usize },

    #[error("Integer field of {length} bytes is too wide")]
    OversizedInteger { length: usize },

    #[error("Unknown transaction type {tag}")]
    UnknownTxType { tag: u8 },
}
