//! Undo-log-backed mutation journal
//!
//! Every state change issued from contract code funnels through
//! [`log_and_write`]. Before a row is updated its previous column values are
//! serialized into a rollback record, and the row's `rb_id` column is
//! stamped with the record id, chaining the row's history backward. Undo at
//! any granularity (one write, one transaction, a block range) is a forward
//! compensating write through the same machinery, never abort-in-place.
//!
//! Direct, unlogged writes are reserved for privileged bootstrap; nothing in
//! contract execution bypasses this path.

use crate::context::TransactionContext;
use crate::error::{EngineError, JournalError, ResourceError};
use crate::fingerprint::Fingerprinter;
use crate::storage::{
    is_custom_table, Assignment, ColumnKind, ColumnMeta, Delete, Filters, Insert, Row, Select,
    Statement, StorageSession, Update, Value,
};
use crate::wire::parse_block;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured pre-image of a mutated row
///
/// On the wire this is a JSON map of column name to string with binary
/// columns hex-encoded, the layout rollback journals have always used; the
/// struct form keeps `prev_rb_id` typed inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreImage {
    pub prev_rb_id: i64,
    pub columns: BTreeMap<String, String>,
}

impl PreImage {
    pub fn to_json(&self) -> Result<String, JournalError> {
        let mut map = self.columns.clone();
        map.insert("prev_rb_id".to_string(), self.prev_rb_id.to_string());
        serde_json::to_string(&map).map_err(|e| JournalError::Corrupt {
            rb_id: 0,
            reason: format!("pre-image serialization failed: {}", e),
        })
    }

    pub fn from_json(rb_id: i64, data: &str) -> Result<Self, JournalError> {
        let mut map: BTreeMap<String, String> =
            serde_json::from_str(data).map_err(|e| JournalError::Corrupt {
                rb_id,
                reason: format!("pre-image is not a JSON map: {}", e),
            })?;
        let prev_rb_id = map
            .remove("prev_rb_id")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| JournalError::Corrupt {
                rb_id,
                reason: "pre-image has no prev_rb_id".to_string(),
            })?;
        Ok(Self {
            prev_rb_id,
            columns: map,
        })
    }
}

fn column_kinds(meta: &[ColumnMeta]) -> BTreeMap<&str, ColumnKind> {
    meta.iter().map(|c| (c.name.as_str(), c.kind)).collect()
}

/// Hex-looking text bound for a binary column becomes bytes, matching the
/// wire convention for hashes and keys.
fn normalize_binary(kind: Option<ColumnKind>, value: Value) -> Value {
    if kind == Some(ColumnKind::Binary) {
        if let Value::Text(s) = &value {
            if let Ok(decoded) = hex::decode(s) {
                return Value::Bytes(decoded);
            }
        }
    }
    value
}

fn row_pk(row: &Row) -> i64 {
    row.get("id").and_then(Value::as_int).unwrap_or(0)
}

/// Log a mutation and apply it
///
/// `fields` follow the wire convention where a leading `+`/`-` requests a
/// relative update. Empty `match_keys` means "insert a new row"; otherwise
/// the matching row is updated (or inserted when absent). Every statement's
/// estimated cost is charged against the context's fuel before it runs.
/// Returns the total charged cost and the affected row id.
pub fn log_and_write(
    session: &mut dyn StorageSession,
    ctx: &mut TransactionContext,
    table: &str,
    fields: &[&str],
    values: &[Value],
    match_keys: &Filters,
    general_rollback: bool,
) -> Result<(i64, i64), EngineError> {
    if general_rollback && ctx.block.is_none() {
        return Err(JournalError::BlockRequired.into());
    }

    let meta = session.columns(table)?;
    let kinds = column_kinds(&meta);

    let mut assignments = Vec::with_capacity(fields.len());
    for (field, value) in fields.iter().zip(values.iter().cloned()) {
        let mut assignment = Assignment::parse(field, value);
        let kind = kinds.get(assignment.column.as_str()).copied();
        assignment.value = normalize_binary(kind, assignment.value);
        if kind == Some(ColumnKind::Binary) {
            if let Value::Bytes(bytes) = &assignment.value {
                if bytes.len() > 64 && is_custom_table(session, table)? {
                    return Err(ResourceError::OversizedField {
                        column: assignment.column.clone(),
                    }
                    .into());
                }
            }
        }
        assignments.push(assignment);
    }

    let mut total_cost = 0i64;
    let block_id = ctx.block_id();

    let existing = if match_keys.is_empty() {
        None
    } else {
        let select = Select {
            table: table.to_string(),
            columns: Vec::new(),
            filters: match_keys.clone(),
        };
        let cost = session.estimate_cost(&Statement::Select(select.clone()))?;
        ctx.fuel.charge(cost)?;
        total_cost += cost;
        session.query_row(&select)?
    };

    let row_id = match existing {
        Some(row) => {
            let pre_image = PreImage {
                prev_rb_id: row.get("rb_id").and_then(Value::as_int).unwrap_or(0),
                columns: assignments
                    .iter()
                    .map(|a| {
                        let previous = row.get(&a.column).cloned().unwrap_or(Value::Null);
                        (a.column.clone(), previous.to_wire_string())
                    })
                    .collect(),
            };
            let rb_id = session.next_id("rollback")?;
            let record = Statement::Insert(Insert {
                table: "rollback".to_string(),
                columns: vec![
                    ("id".to_string(), Value::Int(rb_id)),
                    ("block_id".to_string(), Value::Int(block_id)),
                    ("data".to_string(), Value::Text(pre_image.to_json()?)),
                ],
            });
            let mut stamped = assignments.clone();
            stamped.push(Assignment::set("rb_id", Value::Int(rb_id)));
            let update = Statement::Update(Update {
                table: table.to_string(),
                assignments: stamped,
                filters: match_keys.clone(),
            });

            let cost = session.estimate_cost(&record)? + session.estimate_cost(&update)?;
            ctx.fuel.charge(cost)?;
            total_cost += cost;
            session.execute(&record)?;
            session.execute(&update)?;
            row_pk(&row)
        }
        None => {
            let mut columns: Vec<(String, Value)> = assignments
                .iter()
                .map(|a| (a.column.clone(), a.value.clone()))
                .collect();
            for (col, val) in match_keys {
                if !columns.iter().any(|(name, _)| name == col) {
                    columns.push((col.clone(), val.clone()));
                }
            }
            let row_id = match columns
                .iter()
                .find(|(name, _)| name == "id")
                .and_then(|(_, val)| val.as_int())
            {
                Some(id) => id,
                None => {
                    let id = session.next_id(table)?;
                    columns.push(("id".to_string(), Value::Int(id)));
                    id
                }
            };
            let insert = Statement::Insert(Insert {
                table: table.to_string(),
                columns,
            });
            let cost = session.estimate_cost(&insert)?;
            ctx.fuel.charge(cost)?;
            total_cost += cost;
            session.execute(&insert)?;
            row_id
        }
    };

    if general_rollback {
        let id = session.next_id("rollback_tx")?;
        session.execute(&Statement::Insert(Insert {
            table: "rollback_tx".to_string(),
            columns: vec![
                ("id".to_string(), Value::Int(id)),
                ("block_id".to_string(), Value::Int(block_id)),
                ("tx_hash".to_string(), Value::Bytes(ctx.tx_hash.clone())),
                ("table_name".to_string(), Value::Text(table.to_string())),
                ("table_id".to_string(), Value::Int(row_id)),
            ],
        }))?;
    }

    Ok((total_cost, row_id))
}

/// Undo the most recent logged mutation of one row
///
/// A row whose `rb_id` is zero was created by the logged write, so its undo
/// is deletion. Otherwise the row's current rollback record is loaded, every
/// pre-image column is restored, `rb_id` is re-linked to the previous record
/// and the consumed record is deleted.
pub fn undo_row(
    session: &mut dyn StorageSession,
    table: &str,
    row_id: i64,
) -> Result<(), EngineError> {
    let row = match session
        .query_row(&Select::all(table).filter("id", Value::Int(row_id)))?
    {
        Some(row) => row,
        None => return Ok(()),
    };
    let rb_id = row.get("rb_id").and_then(Value::as_int).unwrap_or(0);

    if rb_id == 0 {
        session.execute(&Statement::Delete(Delete {
            table: table.to_string(),
            filters: vec![("id".to_string(), Value::Int(row_id))],
        }))?;
        return Ok(());
    }

    let record = session
        .query_row(&Select::all("rollback").filter("id", Value::Int(rb_id)))?
        .ok_or(JournalError::RecordNotFound { rb_id })?;
    let data = record
        .get("data")
        .and_then(Value::as_text)
        .ok_or_else(|| JournalError::Corrupt {
            rb_id,
            reason: "record has no data column".to_string(),
        })?;
    let pre_image = PreImage::from_json(rb_id, data)?;

    let columns = session.columns(table)?;
    let kinds = column_kinds(&columns);
    let mut assignments = Vec::with_capacity(pre_image.columns.len() + 1);
    for (column, stored) in &pre_image.columns {
        let value = match kinds.get(column.as_str()) {
            Some(ColumnKind::Binary) => {
                Value::Bytes(hex::decode(stored).map_err(|_| JournalError::Corrupt {
                    rb_id,
                    reason: format!("column {} is not valid hex", column),
                })?)
            }
            Some(ColumnKind::Integer) => {
                Value::Int(stored.parse().map_err(|_| JournalError::Corrupt {
                    rb_id,
                    reason: format!("column {} is not an integer", column),
                })?)
            }
            _ => Value::Text(stored.clone()),
        };
        assignments.push(Assignment::set(column, value));
    }
    assignments.push(Assignment::set("rb_id", Value::Int(pre_image.prev_rb_id)));

    session.execute(&Statement::Update(Update {
        table: table.to_string(),
        assignments,
        filters: vec![("id".to_string(), Value::Int(row_id))],
    }))?;
    session.execute(&Statement::Delete(Delete {
        table: "rollback".to_string(),
        filters: vec![("id".to_string(), Value::Int(rb_id))],
    }))?;
    Ok(())
}

fn undo_tracked_rows(
    session: &mut dyn StorageSession,
    mut tracked: Vec<Row>,
) -> Result<(), EngineError> {
    // newest first, so chained mutations of one row unwind in order
    tracked.sort_by_key(|row| std::cmp::Reverse(row_pk(row)));
    for row in tracked {
        let table = row
            .get("table_name")
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string();
        let row_id = row.get("table_id").and_then(Value::as_int).unwrap_or(0);
        undo_row(session, &table, row_id)
            .map_err(|e| JournalError::RollbackFailed {
                reason: format!("undo of {} row {} failed: {}", table, row_id, e),
            })?;
    }
    Ok(())
}

/// Revert every mutation one transaction performed
///
/// Locates the rows through the transaction's rollback-tx records, undoes
/// them newest-first and deletes the records. Unrelated rows are untouched.
pub fn undo_transaction(
    session: &mut dyn StorageSession,
    tx_hash: &[u8],
) -> Result<(), EngineError> {
    let tracked = session.query_all(
        &Select::all("rollback_tx").filter("tx_hash", Value::Bytes(tx_hash.to_vec())),
    )?;
    undo_tracked_rows(session, tracked)?;
    session.execute(&Statement::Delete(Delete {
        table: "rollback_tx".to_string(),
        filters: vec![("tx_hash".to_string(), Value::Bytes(tx_hash.to_vec()))],
    }))?;
    Ok(())
}

/// Revert every mutation recorded for one block and delete the block row
///
/// The stored block body is replayed through the undo machinery: each of its
/// transactions loses its `log_transactions` entry, so re-applying the same
/// block after a reorganization is not mistaken for a duplicate.
pub fn undo_block(
    session: &mut dyn StorageSession,
    fingerprinter: &Fingerprinter,
    block_id: i64,
) -> Result<(), EngineError> {
    let stored = session.query_row(&Select::all("blocks").filter("id", Value::Int(block_id)))?;
    if let Some(raw) = stored.and_then(|row| {
        row.get("data").and_then(Value::as_bytes).map(<[u8]>::to_vec)
    }) {
        let (_, tx_bodies) = parse_block(&raw)?;
        for body in &tx_bodies {
            let tx_hash = fingerprinter.double_hash(body)?;
            session.execute(&Statement::Delete(Delete {
                table: "log_transactions".to_string(),
                filters: vec![("hash".to_string(), Value::Bytes(tx_hash.0.to_vec()))],
            }))?;
        }
    }

    let tracked = session.query_all(
        &Select::all("rollback_tx").filter("block_id", Value::Int(block_id)),
    )?;
    undo_tracked_rows(session, tracked)?;
    session.execute(&Statement::Delete(Delete {
        table: "rollback_tx".to_string(),
        filters: vec![("block_id".to_string(), Value::Int(block_id))],
    }))?;
    session.execute(&Statement::Delete(Delete {
        table: "blocks".to_string(),
        filters: vec![("id".to_string(), Value::Int(block_id))],
    }))?;
    Ok(())
}

/// Undo every stored block at or above `from_block_id`, most recent first
///
/// Chain reorganization runs this before any competing block is written, so
/// the ledger never holds mutations from two histories at once.
pub fn undo_block_range(
    session: &mut dyn StorageSession,
    fingerprinter: &Fingerprinter,
    from_block_id: i64,
) -> Result<(), EngineError> {
    let mut block_ids: Vec<i64> = session
        .query_all(&Select::all("blocks"))?
        .iter()
        .filter_map(|row| row.get("id").and_then(Value::as_int))
        .filter(|id| *id >= from_block_id)
        .collect();
    block_ids.sort_by_key(|id| std::cmp::Reverse(*id));
    for block_id in block_ids {
        undo_block(session, fingerprinter, block_id)?;
    }
    Ok(())
}

/// Delete rollback records owned by blocks below the horizon
///
/// Finalized blocks can no longer be rolled back, so their journal entries
/// only cost space. Rows keep their stale `rb_id`; undoing past the horizon
/// is not supported. Returns the number of records removed.
pub fn prune_before(
    session: &mut dyn StorageSession,
    horizon_block_id: i64,
) -> Result<usize, EngineError> {
    let mut pruned = 0;
    for table in ["rollback", "rollback_tx"] {
        let rows = session.query_all(&Select::all(table))?;
        for row in rows {
            let block_id = row.get("block_id").and_then(Value::as_int).unwrap_or(0);
            if block_id < horizon_block_id {
                session.execute(&Statement::Delete(Delete {
                    table: table.to_string(),
                    filters: vec![("id".to_string(), Value::Int(row_pk(&row)))],
                }))?;
                pruned += 1;
            }
        }
    }
    Ok(pruned)
}
