//! In-memory reference storage backend
//!
//! Implements the [`StorageSession`] seam over BTreeMap tables with a
//! deterministic cost model. Transaction support is a bincode snapshot of
//! the whole store taken when a session opens and restored on rollback;
//! that snapshot is the storage-level "abort the whole block" primitive the
//! replay controller relies on. The backend also serves the test suite and
//! the benches.

use crate::error::StorageError;
use crate::storage::{
    AssignOp, ColumnKind, ColumnMeta, Delete, Insert, Row, Select, Statement, StorageSession,
    Update, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    columns: Vec<ColumnMeta>,
    rows: Vec<Row>,
    next_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStorage {
    tables: BTreeMap<String, Table>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, name: &str, columns: &[(&str, ColumnKind)]) {
        let table = Table {
            columns: columns
                .iter()
                .map(|(col, kind)| ColumnMeta {
                    name: col.to_string(),
                    kind: *kind,
                })
                .collect(),
            rows: Vec::new(),
            next_id: 1,
        };
        self.tables.insert(name.to_string(), table);
    }

    /// Insert a row directly, bypassing sessions. Bootstrap only; contract
    /// code must go through the mutation journal.
    pub fn seed_row(&mut self, table: &str, cells: &[(&str, Value)]) {
        if let Some(t) = self.tables.get_mut(table) {
            let row: Row = cells
                .iter()
                .map(|(col, val)| (col.to_string(), val.clone()))
                .collect();
            if let Some(id) = row.get("id").and_then(Value::as_int) {
                if id >= t.next_id {
                    t.next_id = id + 1;
                }
            }
            t.rows.push(row);
        }
    }

    pub fn session(&mut self) -> MemorySession<'_> {
        let snapshot = bincode::serialize(&self.tables).ok();
        MemorySession {
            storage: self,
            snapshot,
        }
    }

    fn table(&self, name: &str) -> Result<&Table, StorageError> {
        self.tables.get(name).ok_or_else(|| StorageError::MissingTable {
            table: name.to_string(),
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StorageError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::MissingTable {
                table: name.to_string(),
            })
    }
}

fn matches(row: &Row, filters: &[(String, Value)]) -> bool {
    filters
        .iter()
        .all(|(col, val)| row.get(col).map(|cell| cell == val).unwrap_or(false))
}

fn project(row: &Row, columns: &[String]) -> Row {
    if columns.is_empty() {
        return row.clone();
    }
    columns
        .iter()
        .filter_map(|col| row.get(col).map(|cell| (col.clone(), cell.clone())))
        .collect()
}

/// Apply a relative or absolute assignment to a cell. Relative updates work
/// on integer cells and on decimal-integer text cells (currency amounts).
fn apply_assignment(cell: &mut Value, op: AssignOp, value: &Value) -> Result<(), StorageError> {
    match op {
        AssignOp::Set => {
            *cell = value.clone();
            Ok(())
        }
        AssignOp::Add | AssignOp::Sub => {
            let sign: i128 = if op == AssignOp::Add { 1 } else { -1 };
            match cell {
                Value::Int(current) => {
                    let delta = value.as_int().ok_or_else(|| StorageError::BadValue {
                        column: String::new(),
                        expected: "integer delta".to_string(),
                    })?;
                    *current += sign as i64 * delta;
                    Ok(())
                }
                Value::Text(current) => {
                    let base: i128 = current.parse().unwrap_or(0);
                    let delta: i128 = value
                        .to_wire_string()
                        .parse()
                        .map_err(|_| StorageError::BadValue {
                            column: String::new(),
                            expected: "numeric delta".to_string(),
                        })?;
                    *current = (base + sign * delta).to_string();
                    Ok(())
                }
                _ => Err(StorageError::BadValue {
                    column: String::new(),
                    expected: "numeric cell".to_string(),
                }),
            }
        }
    }
}

pub struct MemorySession<'a> {
    storage: &'a mut MemoryStorage,
    snapshot: Option<Vec<u8>>,
}

impl StorageSession for MemorySession<'_> {
    fn query_row(&self, select: &Select) -> Result<Option<Row>, StorageError> {
        let table = self.storage.table(&select.table)?;
        Ok(table
            .rows
            .iter()
            .find(|row| matches(row, &select.filters))
            .map(|row| project(row, &select.columns)))
    }

    fn query_all(&self, select: &Select) -> Result<Vec<Row>, StorageError> {
        let table = self.storage.table(&select.table)?;
        Ok(table
            .rows
            .iter()
            .filter(|row| matches(row, &select.filters))
            .map(|row| project(row, &select.columns))
            .collect())
    }

    fn execute(&mut self, statement: &Statement) -> Result<(), StorageError> {
        match statement {
            Statement::Select(_) => Ok(()),
            Statement::Update(Update {
                table,
                assignments,
                filters,
            }) => {
                let t = self.storage.table_mut(table)?;
                for row in t.rows.iter_mut().filter(|row| matches(row, filters)) {
                    for a in assignments {
                        let cell = row.entry(a.column.clone()).or_insert(Value::Null);
                        apply_assignment(cell, a.op, &a.value).map_err(|e| match e {
                            StorageError::BadValue { expected, .. } => StorageError::BadValue {
                                column: a.column.clone(),
                                expected,
                            },
                            other => other,
                        })?;
                    }
                }
                Ok(())
            }
            Statement::Insert(Insert { table, columns }) => {
                let t = self.storage.table_mut(table)?;
                let row: Row = columns
                    .iter()
                    .map(|(col, val)| (col.clone(), val.clone()))
                    .collect();
                if let Some(id) = row.get("id").and_then(Value::as_int) {
                    if id >= t.next_id {
                        t.next_id = id + 1;
                    }
                }
                t.rows.push(row);
                Ok(())
            }
            Statement::Delete(Delete { table, filters }) => {
                let t = self.storage.table_mut(table)?;
                t.rows.retain(|row| !matches(row, filters));
                Ok(())
            }
        }
    }

    fn estimate_cost(&self, statement: &Statement) -> Result<i64, StorageError> {
        let (table, base) = match statement {
            Statement::Select(s) => (&s.table, 1),
            Statement::Update(u) => (&u.table, 2),
            Statement::Insert(i) => (&i.table, 2),
            Statement::Delete(d) => (&d.table, 2),
        };
        let rows = self.storage.table(table)?.rows.len() as i64;
        Ok(base + rows / 16)
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnMeta>, StorageError> {
        Ok(self.storage.table(table)?.columns.clone())
    }

    fn next_id(&mut self, table: &str) -> Result<i64, StorageError> {
        let t = self.storage.table_mut(table)?;
        let id = t.next_id;
        t.next_id += 1;
        Ok(id)
    }

    fn has_table(&self, table: &str) -> bool {
        self.storage.tables.contains_key(table)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        let snapshot = self.snapshot.take().ok_or_else(|| StorageError::Backend {
            reason: "no snapshot to roll back to".to_string(),
        })?;
        self.storage.tables =
            bincode::deserialize(&snapshot).map_err(|e| StorageError::Backend {
                reason: format!("snapshot restore failed: {}", e),
            })?;
        Ok(())
    }
}

/// Create the system schema consumed by the engine
pub fn bootstrap_system_tables(storage: &mut MemoryStorage) {
    storage.create_table(
        "ecosystems",
        &[("id", ColumnKind::Integer), ("name", ColumnKind::Text)],
    );
    storage.create_table(
        "blocks",
        &[
            ("id", ColumnKind::Integer),
            ("hash", ColumnKind::Binary),
            ("data", ColumnKind::Binary),
            ("ecosystem_id", ColumnKind::Integer),
            ("key_id", ColumnKind::Integer),
            ("node_position", ColumnKind::Integer),
            ("time", ColumnKind::Integer),
            ("tx_count", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        "info_block",
        &[
            ("block_id", ColumnKind::Integer),
            ("hash", ColumnKind::Binary),
        ],
    );
    storage.create_table(
        "rollback",
        &[
            ("id", ColumnKind::Integer),
            ("block_id", ColumnKind::Integer),
            ("data", ColumnKind::Text),
        ],
    );
    storage.create_table(
        "rollback_tx",
        &[
            ("id", ColumnKind::Integer),
            ("block_id", ColumnKind::Integer),
            ("tx_hash", ColumnKind::Binary),
            ("table_name", ColumnKind::Text),
            ("table_id", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        "log_transactions",
        &[("hash", ColumnKind::Binary), ("time", ColumnKind::Integer)],
    );
    storage.create_table(
        "transactions",
        &[
            ("hash", ColumnKind::Binary),
            ("verified", ColumnKind::Integer),
            ("used", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        "transactions_status",
        &[
            ("hash", ColumnKind::Binary),
            ("time", ColumnKind::Integer),
            ("ecosystem_id", ColumnKind::Integer),
            ("key_id", ColumnKind::Integer),
            ("block_id", ColumnKind::Integer),
            ("error", ColumnKind::Text),
        ],
    );
}

/// Create one ecosystem's namespaced tables
pub fn bootstrap_ecosystem(storage: &mut MemoryStorage, eco: i64) {
    storage.seed_row(
        "ecosystems",
        &[
            ("id", Value::Int(eco)),
            ("name", Value::Text(format!("ecosystem {}", eco))),
        ],
    );
    storage.create_table(
        &format!("{}_parameters", eco),
        &[
            ("id", ColumnKind::Integer),
            ("name", ColumnKind::Text),
            ("value", ColumnKind::Text),
            ("conditions", ColumnKind::Text),
            ("rb_id", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        &format!("{}_keys", eco),
        &[
            ("id", ColumnKind::Integer),
            ("pub", ColumnKind::Binary),
            ("amount", ColumnKind::Text),
            ("rb_id", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        &format!("{}_tables", eco),
        &[
            ("id", ColumnKind::Integer),
            ("name", ColumnKind::Text),
            ("permissions", ColumnKind::Text),
            ("columns", ColumnKind::Text),
            ("rb_id", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        &format!("{}_contracts", eco),
        &[
            ("id", ColumnKind::Integer),
            ("value", ColumnKind::Text),
            ("wallet_id", ColumnKind::Integer),
            ("token_id", ColumnKind::Integer),
            ("active", ColumnKind::Integer),
            ("rb_id", ColumnKind::Integer),
        ],
    );
    storage.create_table(
        &format!("{}_dedicated_contracts", eco),
        &[
            ("id", ColumnKind::Integer),
            ("value", ColumnKind::Text),
            ("rb_id", ColumnKind::Integer),
        ],
    );
}
