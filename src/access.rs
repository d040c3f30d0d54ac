//! Access-control condition evaluation
//!
//! Condition sources are stored in the ledger and compiled to executable
//! predicates by the embedded-language collaborator. Fetching the condition
//! and evaluating it are deliberately separate: a missing condition is a
//! hard denial with a clear error, which is not the same thing as an
//! expression that evaluates to false.

use crate::context::TransactionContext;
use crate::error::{AccessError, EngineError};
use crate::storage::{is_custom_table, split_prefixed, Select, StorageSession, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Read-only view a condition expression evaluates against
pub struct EvalScope<'a> {
    pub ctx: &'a TransactionContext,
    pub session: &'a dyn StorageSession,
}

/// Compiled boolean condition
pub type Predicate = Arc<dyn Fn(&EvalScope<'_>) -> Result<bool, EngineError> + Send + Sync>;

/// Interpreter collaborator: compiles a condition source string scoped to
/// an ecosystem into an executable predicate.
pub trait ConditionCompiler: Send + Sync {
    fn compile(&self, source: &str, ecosystem_id: i64) -> Result<Predicate, EngineError>;
}

/// Evaluates stored access conditions with a compile cache
pub struct AccessEvaluator {
    compiler: Arc<dyn ConditionCompiler>,
    cache: Mutex<HashMap<(i64, String), Predicate>>,
}

impl AccessEvaluator {
    pub fn new(compiler: Arc<dyn ConditionCompiler>) -> Self {
        Self {
            compiler,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compile (cached) and run a condition expression
    ///
    /// Compile and runtime failures surface as evaluation errors; a falsy
    /// result is `Ok(false)`, not an error.
    pub fn evaluate(&self, source: &str, scope: &EvalScope<'_>) -> Result<bool, EngineError> {
        let key = (scope.ctx.ecosystem_id, source.to_string());
        let predicate = {
            let cache = self.cache.lock().expect("condition cache poisoned");
            cache.get(&key).cloned()
        };
        let predicate = match predicate {
            Some(p) => p,
            None => {
                let compiled = self
                    .compiler
                    .compile(source, scope.ctx.ecosystem_id)
                    .map_err(|e| AccessError::Eval {
                        reason: format!("compile failed: {}", e),
                    })?;
                let mut cache = self.cache.lock().expect("condition cache poisoned");
                cache.insert(key, compiled.clone());
                compiled
            }
        };
        predicate(scope).map_err(|e| {
            AccessError::Eval {
                reason: format!("runtime failure: {}", e),
            }
            .into()
        })
    }

    /// Evaluate and turn a falsy result into an access denial
    pub fn require(
        &self,
        source: &str,
        scope: &EvalScope<'_>,
        subject: &str,
    ) -> Result<(), EngineError> {
        if self.evaluate(source, scope)? {
            Ok(())
        } else {
            Err(AccessError::Denied {
                subject: subject.to_string(),
            }
            .into())
        }
    }

    /// Check the stored condition of a named ecosystem parameter
    pub fn check_state_parameter(
        &self,
        scope: &EvalScope<'_>,
        ecosystem_id: i64,
        name: &str,
    ) -> Result<(), EngineError> {
        let table = format!("{}_parameters", ecosystem_id);
        let row = scope
            .session
            .query_row(&Select::all(&table).filter("name", Value::Text(name.to_string())))?
            .ok_or_else(|| AccessError::MissingCondition {
                name: name.to_string(),
            })?;
        let condition = row
            .get("conditions")
            .and_then(Value::as_text)
            .unwrap_or_default();
        if condition.is_empty() {
            return Err(AccessError::MissingCondition {
                name: name.to_string(),
            }
            .into());
        }
        self.require(condition, scope, name)
    }

    /// Check write access to a table for one action (`insert`, `update`,
    /// `new_column`). The ecosystem's own `parameters` table is special:
    /// only the configured founder account may write it, by identity, never
    /// by expression.
    pub fn check_table_access(
        &self,
        scope: &EvalScope<'_>,
        table: &str,
        action: &str,
    ) -> Result<(), EngineError> {
        if self.founder_gate(scope, table)? {
            return Ok(());
        }
        if !is_custom_table(scope.session, table)? {
            return Ok(());
        }
        match self.stored_permission(scope, table, "permissions", action)? {
            Some(condition) => self.require(&condition, scope, &format!("{} on {}", action, table)),
            None => Ok(()),
        }
    }

    /// Check write access to specific columns; a column without a stored
    /// expression falls back to the `*` entry, then to permit.
    pub fn check_column_access(
        &self,
        scope: &EvalScope<'_>,
        table: &str,
        columns: &[&str],
    ) -> Result<(), EngineError> {
        if self.founder_gate(scope, table)? {
            return Ok(());
        }
        if !is_custom_table(scope.session, table)? {
            return Ok(());
        }
        for column in columns {
            let condition = match self.stored_permission(scope, table, "columns", column)? {
                Some(c) => Some(c),
                None => self.stored_permission(scope, table, "columns", "*")?,
            };
            if let Some(condition) = condition {
                self.require(&condition, scope, &format!("column {} of {}", column, table))?;
            }
        }
        Ok(())
    }

    /// Returns Ok(true) when the table is the ecosystem's parameters table
    /// and the caller is its founder; errors when it is the parameters
    /// table and the caller is not.
    fn founder_gate(&self, scope: &EvalScope<'_>, table: &str) -> Result<bool, EngineError> {
        if table != format!("{}_parameters", scope.ctx.ecosystem_id) {
            return Ok(false);
        }
        let founder = scope
            .session
            .query_row(
                &Select::all(table).filter("name", Value::Text("founder_account".to_string())),
            )?
            .and_then(|row| row.get("value").and_then(Value::as_int));
        match founder {
            Some(founder) if founder == scope.ctx.key_id => Ok(true),
            _ => Err(AccessError::Denied {
                subject: table.to_string(),
            }
            .into()),
        }
    }

    /// Stored permission expression for a key inside a JSON column of the
    /// table catalog; None means nothing is stored and the action defaults
    /// to permitted.
    fn stored_permission(
        &self,
        scope: &EvalScope<'_>,
        table: &str,
        catalog_column: &str,
        key: &str,
    ) -> Result<Option<String>, EngineError> {
        let (eco, rest) = match split_prefixed(table) {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let catalog = format!("{}_tables", eco);
        let row = match scope
            .session
            .query_row(&Select::all(&catalog).filter("name", Value::Text(rest.to_string())))?
        {
            Some(row) => row,
            None => return Ok(None),
        };
        let raw = row
            .get(catalog_column)
            .and_then(Value::as_text)
            .unwrap_or_default();
        if raw.is_empty() {
            return Ok(None);
        }
        let map: HashMap<String, String> =
            serde_json::from_str(raw).map_err(|e| AccessError::Eval {
                reason: format!("stored {} of {} is not a JSON map: {}", catalog_column, table, e),
            })?;
        Ok(map.get(key).filter(|c| !c.is_empty()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::{bootstrap_ecosystem, bootstrap_system_tables, MemoryStorage};

    /// Test compiler: "true" and "false" are literals, "caller_is(n)"
    /// compares the caller id, anything else fails to compile.
    struct FixtureCompiler;

    impl ConditionCompiler for FixtureCompiler {
        fn compile(&self, source: &str, _ecosystem_id: i64) -> Result<Predicate, EngineError> {
            match source {
                "true" => Ok(Arc::new(|_scope: &EvalScope<'_>| Ok(true))),
                "false" => Ok(Arc::new(|_scope: &EvalScope<'_>| Ok(false))),
                s if s.starts_with("caller_is(") && s.ends_with(')') => {
                    let id: i64 = s["caller_is(".len()..s.len() - 1]
                        .parse()
                        .map_err(|_| AccessError::Eval {
                            reason: "bad caller id".to_string(),
                        })?;
                    Ok(Arc::new(move |scope: &EvalScope<'_>| {
                        Ok(scope.ctx.key_id == id)
                    }))
                }
                other => Err(AccessError::Eval {
                    reason: format!("cannot compile {}", other),
                }
                .into()),
            }
        }
    }

    fn storage_fixture() -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        bootstrap_system_tables(&mut storage);
        bootstrap_ecosystem(&mut storage, 1);
        storage.seed_row(
            "1_parameters",
            &[
                ("id", Value::Int(1)),
                ("name", Value::Text("founder_account".to_string())),
                ("value", Value::Text("42".to_string())),
                ("conditions", Value::Text("caller_is(42)".to_string())),
                ("rb_id", Value::Int(0)),
            ],
        );
        storage.seed_row(
            "1_tables",
            &[
                ("id", Value::Int(1)),
                ("name", Value::Text("accounts".to_string())),
                (
                    "permissions",
                    Value::Text(r#"{"insert":"true","update":"caller_is(42)"}"#.to_string()),
                ),
                (
                    "columns",
                    Value::Text(r#"{"amount":"false"}"#.to_string()),
                ),
                ("rb_id", Value::Int(0)),
            ],
        );
        storage
    }

    fn ctx_for(key_id: i64) -> TransactionContext {
        TransactionContext::builder()
            .with_ecosystem(1)
            .with_key_id(key_id)
            .build()
    }

    #[test]
    fn test_evaluate_literals() {
        let mut storage = storage_fixture();
        let session = storage.session();
        let ctx = ctx_for(1);
        let scope = EvalScope {
            ctx: &ctx,
            session: &session,
        };
        let evaluator = AccessEvaluator::new(Arc::new(FixtureCompiler));

        assert!(evaluator.evaluate("true", &scope).unwrap());
        assert!(!evaluator.evaluate("false", &scope).unwrap());
        assert!(evaluator.evaluate("not a program", &scope).is_err());
    }

    #[test]
    fn test_state_parameter_access() {
        let mut storage = storage_fixture();
        let session = storage.session();
        let evaluator = AccessEvaluator::new(Arc::new(FixtureCompiler));

        let founder = ctx_for(42);
        let scope = EvalScope {
            ctx: &founder,
            session: &session,
        };
        assert!(evaluator
            .check_state_parameter(&scope, 1, "founder_account")
            .is_ok());

        let stranger = ctx_for(7);
        let scope = EvalScope {
            ctx: &stranger,
            session: &session,
        };
        assert!(evaluator
            .check_state_parameter(&scope, 1, "founder_account")
            .is_err());
        assert!(
            evaluator
                .check_state_parameter(&scope, 1, "no_such_parameter")
                .is_err(),
            "missing parameter row is a hard denial"
        );
    }

    #[test]
    fn test_table_access_actions() {
        let mut storage = storage_fixture();
        let session = storage.session();
        let evaluator = AccessEvaluator::new(Arc::new(FixtureCompiler));

        let stranger = ctx_for(7);
        let scope = EvalScope {
            ctx: &stranger,
            session: &session,
        };
        assert!(evaluator
            .check_table_access(&scope, "1_accounts", "insert")
            .is_ok());
        assert!(evaluator
            .check_table_access(&scope, "1_accounts", "update")
            .is_err());
        assert!(
            evaluator
                .check_table_access(&scope, "1_accounts", "new_column")
                .is_ok(),
            "no stored expression defaults to permit"
        );
    }

    #[test]
    fn test_parameters_table_founder_only() {
        let mut storage = storage_fixture();
        let session = storage.session();
        let evaluator = AccessEvaluator::new(Arc::new(FixtureCompiler));

        let founder = ctx_for(42);
        let scope = EvalScope {
            ctx: &founder,
            session: &session,
        };
        assert!(evaluator
            .check_table_access(&scope, "1_parameters", "update")
            .is_ok());

        let stranger = ctx_for(7);
        let scope = EvalScope {
            ctx: &stranger,
            session: &session,
        };
        assert!(evaluator
            .check_table_access(&scope, "1_parameters", "update")
            .is_err());
        assert!(evaluator
            .check_column_access(&scope, "1_parameters", &["value"])
            .is_err());
    }

    #[test]
    fn test_column_access() {
        let mut storage = storage_fixture();
        let session = storage.session();
        let evaluator = AccessEvaluator::new(Arc::new(FixtureCompiler));

        let ctx = ctx_for(7);
        let scope = EvalScope {
            ctx: &ctx,
            session: &session,
        };
        assert!(evaluator
            .check_column_access(&scope, "1_accounts", &["amount"])
            .is_err());
        assert!(evaluator
            .check_column_access(&scope, "1_accounts", &["note"])
            .is_ok());
    }
}
