//! Typed statement model and the storage-engine seam
//!
//! The relational engine is an external collaborator. Everything the core
//! issues against it is expressed through the statement types below and the
//! [`StorageSession`] trait, never through string-built SQL. Cost estimation
//! lives on the same seam because fuel metering is denominated in the
//! engine's own execution-cost units.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single storage cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Whether the cell counts as empty for parameter validation
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int(_) => false,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
        }
    }

    /// String form used in pre-images and canonical strings. Binary cells
    /// are hex-encoded so the result survives a JSON round trip.
    pub fn to_wire_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire_string())
    }
}

/// One row, column name to cell. BTreeMap keeps iteration deterministic.
pub type Row = BTreeMap<String, Value>;

/// Column type classes the core needs to reflect on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    Text,
    Binary,
}

/// Reflected column description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub kind: ColumnKind,
}

/// How an assignment combines with the stored cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

/// One column assignment of an UPDATE or INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub op: AssignOp,
    pub value: Value,
}

impl Assignment {
    pub fn set(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            op: AssignOp::Set,
            value,
        }
    }

    /// Parse the wire convention where a leading `+` or `-` on the field
    /// name requests a relative update instead of an absolute set.
    pub fn parse(field: &str, value: Value) -> Self {
        let field = field.trim();
        if let Some(rest) = field.strip_prefix('+') {
            Self {
                column: rest.to_string(),
                op: AssignOp::Add,
                value,
            }
        } else if let Some(rest) = field.strip_prefix('-') {
            Self {
                column: rest.to_string(),
                op: AssignOp::Sub,
                value,
            }
        } else {
            Self::set(field, value)
        }
    }
}

/// Equality filter, all pairs ANDed
pub type Filters = Vec<(String, Value)>;

#[derive(Debug, Clone)]
pub struct Select {
    pub table: String,
    /// Empty means every column
    pub columns: Vec<String>,
    pub filters: Filters,
}

impl Select {
    pub fn all(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, column: &str, value: Value) -> Self {
        self.filters.push((column.to_string(), value));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<Assignment>,
    pub filters: Filters,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<(String, Value)>,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub table: String,
    pub filters: Filters,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Select(Select),
    Update(Update),
    Insert(Insert),
    Delete(Delete),
}

/// One storage-engine transaction
///
/// The replay controller opens a session per block batch; every mutation of
/// the batch happens inside it and either the whole session commits or the
/// whole session rolls back. Reads observe the session's own writes.
pub trait StorageSession {
    /// First row matching the select, with every requested column
    fn query_row(&self, select: &Select) -> Result<Option<Row>, StorageError>;

    /// All matching rows in deterministic (primary key) order
    fn query_all(&self, select: &Select) -> Result<Vec<Row>, StorageError>;

    /// Execute a mutating statement
    fn execute(&mut self, statement: &Statement) -> Result<(), StorageError>;

    /// Estimated execution cost of the statement, in engine cost units.
    /// Queried before execution so fuel overspend is detected first.
    fn estimate_cost(&self, statement: &Statement) -> Result<i64, StorageError>;

    /// Reflected column metadata for a table
    fn columns(&self, table: &str) -> Result<Vec<ColumnMeta>, StorageError>;

    /// Next value of the table's monotonically increasing id sequence
    fn next_id(&mut self, table: &str) -> Result<i64, StorageError>;

    /// Whether the table exists
    fn has_table(&self, table: &str) -> bool;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Split an ecosystem-prefixed table name like `1_keys` into `(1, "keys")`
pub fn split_prefixed(table: &str) -> Option<(i64, &str)> {
    let off = table.find('_')?;
    let prefix: i64 = table[..off].parse().ok()?;
    Some((prefix, &table[off + 1..]))
}

/// Whether the table is a user-defined (custom) table: ecosystem-prefixed
/// and registered in that ecosystem's `{eco}_tables` catalog.
pub fn is_custom_table(
    session: &dyn StorageSession,
    table: &str,
) -> Result<bool, StorageError> {
    let (eco, rest) = match split_prefixed(table) {
        Some(parts) => parts,
        None => return Ok(false),
    };
    let catalog = format!("{}_tables", eco);
    if !session.has_table(&catalog) {
        return Ok(false);
    }
    let found = session.query_row(
        &Select::all(&catalog).filter("name", Value::Text(rest.to_string())),
    )?;
    Ok(found.is_some())
}
