//! Deterministic audit logging
//!
//! The engine never writes to an ambient logger; it collects entries into
//! an [`AuditLog`] owned by the caller, so logging cannot perturb replay
//! determinism. Timestamps come from chain time, never the wall clock.
//! Rejected transactions additionally get a row in `transactions_status`
//! so clients can poll the failure reason without replaying anything.

use crate::error::StorageError;
use crate::storage::{Delete, Insert, Select, Statement, StorageSession, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log level for audit entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Chain time of the surrounding block or transaction
    pub timestamp: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub block_id: Option<i64>,
    pub contract: Option<String>,
    /// Call chain at the time of the entry, for diagnostics
    pub call_chain: Option<String>,
    pub message: String,
    pub metadata: Vec<(String, String)>,
}

impl LogEntry {
    pub fn new(level: LogLevel, time: i64, message: String) -> Self {
        Self {
            level,
            timestamp: DateTime::from_timestamp(time, 0).unwrap_or(DateTime::UNIX_EPOCH),
            tx_hash: None,
            block_id: None,
            contract: None,
            call_chain: None,
            message,
            metadata: Vec::new(),
        }
    }

    pub fn with_tx_hash(mut self, hash: String) -> Self {
        self.tx_hash = Some(hash);
        self
    }

    pub fn with_block(mut self, block_id: i64) -> Self {
        self.block_id = Some(block_id);
        self
    }

    pub fn with_contract(mut self, contract: String, call_chain: String) -> Self {
        self.contract = Some(contract);
        self.call_chain = Some(call_chain);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: String) -> Self {
        self.metadata.push((key.to_string(), value));
        self
    }
}

/// Side-effect-free audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
    min_level: LogLevel,
}

impl AuditLog {
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            entries: Vec::new(),
            min_level,
        }
    }

    pub fn all() -> Self {
        Self::new(LogLevel::Debug)
    }

    pub fn with_info_level() -> Self {
        Self::new(LogLevel::Info)
    }

    pub fn log(&mut self, entry: LogEntry) {
        if entry.level as u8 >= self.min_level as u8 {
            self.entries.push(entry);
        }
    }

    pub fn debug(&mut self, time: i64, message: String) {
        self.log(LogEntry::new(LogLevel::Debug, time, message));
    }

    pub fn info(&mut self, time: i64, message: String) {
        self.log(LogEntry::new(LogLevel::Info, time, message));
    }

    pub fn warn(&mut self, time: i64, message: String) {
        self.log(LogEntry::new(LogLevel::Warn, time, message));
    }

    pub fn error(&mut self, time: i64, message: String) {
        self.log(LogEntry::new(LogLevel::Error, time, message));
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn filter_by_level(&self, level: LogLevel) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.level == level).collect()
    }

    pub fn filter_by_tx(&self, tx_hash: &str) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.tx_hash.as_deref() == Some(tx_hash))
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_info_level()
    }
}

/// Record a rejected transaction's reason against its hash
///
/// Replaces any previous status row for the hash. The reason is truncated
/// to 255 bytes, the column width clients rely on.
pub fn record_tx_error(
    session: &mut dyn StorageSession,
    tx_hash: &[u8],
    time: i64,
    ecosystem_id: i64,
    key_id: i64,
    block_id: i64,
    reason: &str,
) -> Result<(), StorageError> {
    let mut reason = reason.to_string();
    if reason.len() > 255 {
        let mut cut = 255;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    session.execute(&Statement::Delete(Delete {
        table: "transactions_status".to_string(),
        filters: vec![("hash".to_string(), Value::Bytes(tx_hash.to_vec()))],
    }))?;
    session.execute(&Statement::Insert(Insert {
        table: "transactions_status".to_string(),
        columns: vec![
            ("hash".to_string(), Value::Bytes(tx_hash.to_vec())),
            ("time".to_string(), Value::Int(time)),
            ("ecosystem_id".to_string(), Value::Int(ecosystem_id)),
            ("key_id".to_string(), Value::Int(key_id)),
            ("block_id".to_string(), Value::Int(block_id)),
            ("error".to_string(), Value::Text(reason)),
        ],
    }))
}

/// Stored failure reason for a transaction hash, if any
pub fn tx_status(
    session: &dyn StorageSession,
    tx_hash: &[u8],
) -> Result<Option<String>, StorageError> {
    let row = session.query_row(
        &Select::all("transactions_status").filter("hash", Value::Bytes(tx_hash.to_vec())),
    )?;
    Ok(row.and_then(|r| r.get("error").and_then(Value::as_text).map(String::from)))
}
