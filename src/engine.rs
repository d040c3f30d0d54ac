//! Contract execution engine
//!
//! Resolves a program's phases and runs them in the fixed order
//! `init -> conditions -> action` (`rollback` only when the replay
//! controller drives it). `conditions` is the authorization gate: a falsy
//! result stops the chain before `action` ever executes. Fuel is metered
//! throughout and the consumed amount is left on the transaction context
//! for fee settlement.

use crate::access::AccessEvaluator;
use crate::context::TransactionContext;
use crate::error::{AccessError, ContractError, EngineError};
use crate::journal;
use crate::params::ChainParams;
use crate::program::{ContractProgram, ParamType, Phase, PhaseCode, ProgramRegistry};
use crate::storage::{Select, StorageSession, Value};
use crate::wire::TX_TYPE_VALIDATOR_UPDATE;
use std::collections::BTreeMap;

/// Call the contract's `init` sub-program
pub const CALL_INIT: u8 = 0x01;
/// Call the contract's `conditions` sub-program
pub const CALL_CONDITIONS: u8 = 0x02;
/// Call the contract's `action` sub-program
pub const CALL_ACTION: u8 = 0x04;
/// Call the contract's `rollback` sub-program
pub const CALL_ROLLBACK: u8 = 0x08;

/// Variable bindings and capabilities visible to a running sub-program
pub struct Environment<'a> {
    pub ctx: &'a mut TransactionContext,
    pub session: &'a mut dyn StorageSession,
    pub evaluator: &'a AccessEvaluator,
    pub vars: &'a mut BTreeMap<String, Value>,
}

impl Environment<'_> {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }
}

/// Asymmetric-crypto collaborator consumed for signature checks
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        public_keys: &[Vec<u8>],
        message: &str,
        signature: &[u8],
    ) -> Result<bool, EngineError>;
}

/// How a successful monetary call settles its fee
struct FeePlan {
    payer: i64,
    token_ecosystem: i64,
    fuel_rate: i128,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Int(v) => *v != 0,
        Value::Text(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Bytes(b) => !b.is_empty(),
    }
}

/// Bind schema-ordered wire values to named, typed parameters
///
/// Int, Money and Text parameters travel as UTF-8 strings; Bytes are raw.
/// Missing trailing values bind to Null so optionality is decided by
/// validation, not by parsing.
pub fn bind_wire_params(
    program: &ContractProgram,
    raw: &[Vec<u8>],
) -> Result<BTreeMap<String, Value>, EngineError> {
    let mut params = BTreeMap::new();
    for (index, spec) in program.schema.iter().enumerate() {
        let bytes = raw.get(index).map(Vec::as_slice).unwrap_or_default();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            match spec.ty {
                ParamType::Bytes => Value::Bytes(bytes.to_vec()),
                ParamType::Int => {
                    let text = String::from_utf8_lossy(bytes);
                    let parsed = text.parse().map_err(|_| ContractError::Parameter {
                        field: spec.name.clone(),
                        reason: format!("{} is not an integer", text),
                    })?;
                    Value::Int(parsed)
                }
                ParamType::Money | ParamType::Text => {
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            }
        };
        params.insert(spec.name.clone(), value);
    }
    Ok(params)
}

/// The contract execution engine
///
/// Borrows the process-wide registry, parameters and collaborators from the
/// replay controller; one engine serves every transaction of a block batch.
pub struct ContractEngine<'a> {
    pub registry: &'a ProgramRegistry,
    pub params: &'a ChainParams,
    pub evaluator: &'a AccessEvaluator,
    pub verifier: &'a dyn SignatureVerifier,
}

impl<'a> ContractEngine<'a> {
    /// Look up the program the context's transaction targets
    pub fn resolve(
        &self,
        name: &str,
        ecosystem_id: i64,
        dedicated: bool,
    ) -> Result<std::sync::Arc<ContractProgram>, EngineError> {
        Ok(self.registry.resolve(name, ecosystem_id, dedicated)?)
    }

    /// Canonical string the transaction signature covers: time and caller,
    /// then every signature-tagged declared field in schema order.
    pub fn fields_to_sign(&self, program: &ContractProgram, ctx: &TransactionContext) -> String {
        let mut message = format!("{},{}", ctx.time, ctx.key_id);
        for spec in &program.schema {
            if spec.tags.signature {
                let value = ctx.params.get(&spec.name).cloned().unwrap_or(Value::Null);
                message.push(',');
                message.push_str(&value.to_wire_string());
            }
        }
        message
    }

    /// Validate declared parameters and produce the variable bindings
    pub fn build_environment(
        &self,
        ctx: &TransactionContext,
        program: &ContractProgram,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let mut vars = BTreeMap::new();
        for spec in &program.schema {
            let value = ctx.params.get(&spec.name).cloned().unwrap_or(Value::Null);
            if !spec.tags.optional && value.is_empty() {
                return Err(ContractError::Parameter {
                    field: spec.name.clone(),
                    reason: "required field is empty".to_string(),
                }
                .into());
            }
            if spec.tags.address && !value.is_empty() {
                match value.as_int() {
                    Some(address) if address != 0 => {}
                    _ => {
                        return Err(ContractError::Parameter {
                            field: spec.name.clone(),
                            reason: "is not a valid account address".to_string(),
                        }
                        .into())
                    }
                }
            }
            if spec.ty == ParamType::Money && !value.is_empty() {
                let text = value.to_wire_string();
                let digits = text.strip_prefix('-').unwrap_or(&text);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ContractError::Parameter {
                        field: spec.name.clone(),
                        reason: "is not a monetary amount".to_string(),
                    }
                    .into());
                }
            }
            vars.insert(spec.name.clone(), value);
        }
        vars.insert("state".to_string(), Value::Int(ctx.ecosystem_id));
        vars.insert("wallet".to_string(), Value::Int(ctx.key_id));
        vars.insert("type".to_string(), Value::Int(ctx.tx_type));
        vars.insert("time".to_string(), Value::Int(ctx.time));
        vars.insert("block".to_string(), Value::Int(ctx.block_id()));
        vars.insert(
            "block_time".to_string(),
            Value::Int(ctx.block.as_ref().map(|b| b.time).unwrap_or(0)),
        );
        vars.insert("txhash".to_string(), Value::Bytes(ctx.tx_hash.clone()));
        vars.insert("txcost".to_string(), Value::Int(ctx.fuel.balance()));
        Ok(vars)
    }

    /// Signing key of the caller: the ledger-stored key when the account
    /// has one, else the key embedded in the transaction. The reserved
    /// validator-set-update type binds to the node's own key instead.
    fn resolve_public_key(
        &self,
        ctx: &TransactionContext,
        session: &dyn StorageSession,
    ) -> Result<Vec<u8>, EngineError> {
        if ctx.tx_type == TX_TYPE_VALIDATOR_UPDATE as i64 {
            let node = self
                .params
                .node_by_key(ctx.key_id)
                .ok_or(ContractError::MissingPublicKey { key_id: ctx.key_id })?;
            return Ok(node.public.clone());
        }
        let keys_table = format!("{}_keys", ctx.ecosystem_id);
        let stored = if session.has_table(&keys_table) {
            session
                .query_row(&Select::all(&keys_table).filter("id", Value::Int(ctx.key_id)))?
                .and_then(|row| row.get("pub").and_then(Value::as_bytes).map(<[u8]>::to_vec))
        } else {
            None
        };
        let public = match stored {
            Some(key) if !key.is_empty() => key,
            _ => ctx.public_key.clone(),
        };
        if public.is_empty() {
            return Err(ContractError::MissingPublicKey { key_id: ctx.key_id }.into());
        }
        Ok(public)
    }

    /// Externally-invoked entry point: run the flagged phases
    pub fn call_contract(
        &self,
        ctx: &mut TransactionContext,
        session: &mut dyn StorageSession,
        program: &ContractProgram,
        flags: u8,
    ) -> Result<(), EngineError> {
        ctx.with_frame(&program.name, |ctx| {
            self.call_inner(ctx, session, program, flags)
        })
    }

    fn call_inner(
        &self,
        ctx: &mut TransactionContext,
        session: &mut dyn StorageSession,
        program: &ContractProgram,
        flags: u8,
    ) -> Result<(), EngineError> {
        let mut vars = self.build_environment(ctx, program)?;
        let mut price = 0i64;
        let mut fee: Option<FeePlan> = None;

        if flags & CALL_ROLLBACK == 0 && flags & CALL_ACTION != 0 {
            let public = self.resolve_public_key(ctx, session)?;
            let message = self.fields_to_sign(program, ctx);
            let mut candidates = vec![public];
            if !ctx.public_key.is_empty() && candidates[0] != ctx.public_key {
                candidates.push(ctx.public_key.clone());
            }
            if !self.verifier.verify(&candidates, &message, &ctx.signature)? {
                return Err(ContractError::InvalidSignature.into());
            }

            if ctx.ecosystem_id > 0 && !ctx.dedicated {
                if ctx.token_ecosystem == 0 {
                    ctx.token_ecosystem = 1;
                }
                let (payer, token_ecosystem) = if program.owner.active {
                    let owner_token = if program.owner.token_ecosystem == 0 {
                        1
                    } else {
                        program.owner.token_ecosystem
                    };
                    (program.owner.account_id, owner_token)
                } else {
                    (ctx.key_id, ctx.token_ecosystem)
                };
                ctx.token_ecosystem = token_ecosystem;
                let fuel_rate = self.params.fuel_rate(token_ecosystem)?;

                let keys_table = format!("{}_keys", token_ecosystem);
                let payer_row = session
                    .query_row(&Select::all(&keys_table).filter("id", Value::Int(payer)))?
                    .ok_or(ContractError::InsufficientFunds)?;
                if payer == ctx.key_id {
                    let stored = payer_row
                        .get("pub")
                        .and_then(Value::as_bytes)
                        .unwrap_or_default();
                    if !stored.is_empty()
                        && stored != candidates[0].as_slice()
                        && stored != ctx.public_key.as_slice()
                    {
                        return Err(ContractError::KeyMismatch.into());
                    }
                }
                let amount: i128 = payer_row
                    .get("amount")
                    .map(|v| v.to_wire_string())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);

                if let Some(price_fn) = &program.price {
                    let result = run_phase(
                        ctx,
                        session,
                        self.evaluator,
                        &mut vars,
                        price_fn,
                    )?;
                    price = match result {
                        Value::Int(p) => p,
                        _ => return Err(ContractError::BadPriceResult.into()),
                    };
                }

                let size_fuel = self.params.size_fuel * ctx.payload_len as i64 / 1024;
                if amount <= (size_fuel + price) as i128 * fuel_rate {
                    return Err(ContractError::InsufficientFunds.into());
                }
                ctx.fuel.charge(size_fuel)?;
                fee = Some(FeePlan {
                    payer,
                    token_ecosystem,
                    fuel_rate,
                });
            }
        }

        let used_before = ctx.fuel.used();
        ctx.fuel.set_price(price);

        for phase in Phase::ALL {
            if flags & (1 << phase.index()) == 0 {
                continue;
            }
            let code = match program.phases.get(phase) {
                Some(code) => code.clone(),
                None => continue,
            };
            let result = run_phase(ctx, session, self.evaluator, &mut vars, &code);
            match result {
                Ok(value) => {
                    if phase == Phase::Conditions && !truthy(&value) {
                        ctx.used_cost = ctx.fuel.used() - used_before;
                        return Err(AccessError::Denied {
                            subject: format!("conditions of {}", program.name),
                        }
                        .into());
                    }
                }
                Err(err) => {
                    ctx.used_cost = ctx.fuel.used() - used_before;
                    return Err(err);
                }
            }
        }
        ctx.used_cost = ctx.fuel.used() - used_before + price;

        if let Some(plan) = fee {
            if flags & CALL_ACTION != 0 && ctx.block.is_some() {
                self.settle_fee(ctx, session, &plan)?;
            }
        }
        Ok(())
    }

    /// Move the fuel fee: debit the payer, credit the block proposer minus
    /// commission, credit the commission wallet. All three writes go
    /// through the journal with transaction-scoped rollback so a later
    /// failure in the block unwinds them with everything else.
    fn settle_fee(
        &self,
        ctx: &mut TransactionContext,
        session: &mut dyn StorageSession,
        plan: &FeePlan,
    ) -> Result<(), EngineError> {
        let keys_table = format!("{}_keys", plan.token_ecosystem);
        let balance: i128 = session
            .query_row(&Select::all(&keys_table).filter("id", Value::Int(plan.payer)))?
            .and_then(|row| row.get("amount").map(|v| v.to_wire_string()))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let mut to_pay = ctx.used_cost as i128 * plan.fuel_rate;
        if to_pay > balance {
            to_pay = balance;
        }
        if to_pay <= 0 {
            return Ok(());
        }
        // without a configured commission wallet the full amount goes to
        // the proposer; value is moved, never destroyed
        let commission_wallet = self.params.commission_wallet(plan.token_ecosystem);
        let commission = if commission_wallet.is_some() {
            to_pay * self.params.commission_size as i128 / 100
        } else {
            0
        };
        let proposer = ctx.block.as_ref().map(|b| b.key_id).unwrap_or(0);

        journal::log_and_write(
            session,
            ctx,
            &keys_table,
            &["-amount"],
            &[Value::Text(to_pay.to_string())],
            &vec![("id".to_string(), Value::Int(plan.payer))],
            true,
        )?;
        journal::log_and_write(
            session,
            ctx,
            &keys_table,
            &["+amount"],
            &[Value::Text((to_pay - commission).to_string())],
            &vec![("id".to_string(), Value::Int(proposer))],
            true,
        )?;
        if commission > 0 {
            if let Some(wallet) = commission_wallet {
                journal::log_and_write(
                    session,
                    ctx,
                    &keys_table,
                    &["+amount"],
                    &[Value::Text(commission.to_string())],
                    &vec![("id".to_string(), Value::Int(wallet))],
                    true,
                )?;
            }
        }
        Ok(())
    }
}

/// Run one sub-program with a fresh `txcost` binding
fn run_phase(
    ctx: &mut TransactionContext,
    session: &mut dyn StorageSession,
    evaluator: &AccessEvaluator,
    vars: &mut BTreeMap<String, Value>,
    code: &PhaseCode,
) -> Result<Value, EngineError> {
    vars.insert("txcost".to_string(), Value::Int(ctx.fuel.balance()));
    let mut env = Environment {
        ctx,
        session,
        evaluator,
        vars,
    };
    code(&mut env)
}
