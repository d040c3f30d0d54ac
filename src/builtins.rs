//! Built-in ledger operations exposed to running contracts
//!
//! The embedded language's compiler binds these as the host functions
//! behind its `DBInsert` / `DBUpdate` / `DBSelect` / `EcosystemParam`
//! primitives. Writes check table and column permissions first, then go
//! through the mutation journal; there is no other write path from
//! contract code.

use crate::access::EvalScope;
use crate::engine::Environment;
use crate::error::EngineError;
use crate::journal;
use crate::storage::{Row, Select, Statement, Value};

/// Prefix a bare table name with the calling ecosystem
fn scoped_table(env: &Environment<'_>, table: &str) -> String {
    if table.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) && table.contains('_') {
        table.to_string()
    } else {
        format!("{}_{}", env.ctx.ecosystem_id, table)
    }
}

fn assigned_columns<'f>(fields: &[&'f str]) -> Vec<&'f str> {
    fields
        .iter()
        .map(|field| {
            let field = field.trim();
            field
                .strip_prefix('+')
                .or_else(|| field.strip_prefix('-'))
                .unwrap_or(field)
        })
        .collect()
}

/// Insert a row through the journal
///
/// Returns the charged cost and the new row id. Inside a block the write is
/// recorded for transaction-scoped rollback.
pub fn db_insert(
    env: &mut Environment<'_>,
    table: &str,
    fields: &[&str],
    values: &[Value],
) -> Result<(i64, i64), EngineError> {
    let table = scoped_table(env, table);
    {
        let scope = EvalScope {
            ctx: &*env.ctx,
            session: &*env.session,
        };
        env.evaluator.check_table_access(&scope, &table, "insert")?;
        env.evaluator
            .check_column_access(&scope, &table, &assigned_columns(fields))?;
    }
    let general_rollback = env.ctx.block.is_some();
    journal::log_and_write(
        env.session,
        env.ctx,
        &table,
        fields,
        values,
        &Vec::new(),
        general_rollback,
    )
}

/// Update a row by id through the journal
pub fn db_update(
    env: &mut Environment<'_>,
    table: &str,
    row_id: i64,
    fields: &[&str],
    values: &[Value],
) -> Result<(i64, i64), EngineError> {
    let table = scoped_table(env, table);
    {
        let scope = EvalScope {
            ctx: &*env.ctx,
            session: &*env.session,
        };
        env.evaluator.check_table_access(&scope, &table, "update")?;
        env.evaluator
            .check_column_access(&scope, &table, &assigned_columns(fields))?;
    }
    let general_rollback = env.ctx.block.is_some();
    journal::log_and_write(
        env.session,
        env.ctx,
        &table,
        fields,
        values,
        &vec![("id".to_string(), Value::Int(row_id))],
        general_rollback,
    )
}

/// Metered read of matching rows
pub fn db_select(
    env: &mut Environment<'_>,
    table: &str,
    columns: &[&str],
    filters: &[(&str, Value)],
) -> Result<Vec<Row>, EngineError> {
    let table = scoped_table(env, table);
    let select = Select {
        table,
        columns: columns.iter().map(|c| c.to_string()).collect(),
        filters: filters
            .iter()
            .map(|(col, val)| (col.to_string(), val.clone()))
            .collect(),
    };
    let cost = env.session.estimate_cost(&Statement::Select(select.clone()))?;
    env.ctx.fuel.charge(cost)?;
    Ok(env.session.query_all(&select)?)
}

/// Value of a named parameter of the calling ecosystem, empty when unset
pub fn ecosystem_param(env: &mut Environment<'_>, name: &str) -> Result<String, EngineError> {
    let table = format!("{}_parameters", env.ctx.ecosystem_id);
    let select = Select::all(&table).filter("name", Value::Text(name.to_string()));
    let cost = env.session.estimate_cost(&Statement::Select(select.clone()))?;
    env.ctx.fuel.charge(cost)?;
    Ok(env
        .session
        .query_row(&select)?
        .and_then(|row| row.get("value").and_then(Value::as_text).map(String::from))
        .unwrap_or_default())
}
