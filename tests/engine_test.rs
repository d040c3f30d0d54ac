//! Integration tests for the contract execution engine
//!
//! These tests verify:
//! - `conditions` gates `action`: a falsy result stops the chain with no
//!   journaled mutation
//! - Balance sufficiency is checked before any phase runs
//! - Signature verification covers the canonical fields-to-sign string
//! - The price function feeds the consumed cost and rejects bad results
//! - Fee settlement debits the payer and credits proposer and commission

use dste::builtins;
use dste::{
    bootstrap_ecosystem, bootstrap_system_tables, AccessError, AccessEvaluator, BlockContext,
    ChainParams, ConditionCompiler, ContractEngine, ContractError, ContractProgram, EngineError,
    Environment, MemoryStorage, NodeInfo, ParamSpec, ParamType, Phase, Predicate, ProgramRegistry,
    ResourceError, Select, SignatureVerifier, StorageSession, TransactionContext, Value,
    CALL_ACTION, CALL_CONDITIONS, CALL_INIT, TX_TYPE_VALIDATOR_UPDATE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct PermitAll;

impl ConditionCompiler for PermitAll {
    fn compile(&self, _source: &str, _ecosystem_id: i64) -> Result<Predicate, EngineError> {
        Ok(Arc::new(|_scope| Ok(true)))
    }
}

struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(
        &self,
        _public_keys: &[Vec<u8>],
        _message: &str,
        _signature: &[u8],
    ) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// A signature is the digest of the public key concatenated with the
/// message; enough structure to catch a wrong key or a tampered field.
struct DigestVerifier;

fn sign(public: &[u8], message: &str) -> Vec<u8> {
    let mut data = public.to_vec();
    data.extend_from_slice(message.as_bytes());
    dste::Fingerprinter::new().hash(&data).unwrap().0.to_vec()
}

impl SignatureVerifier for DigestVerifier {
    fn verify(
        &self,
        public_keys: &[Vec<u8>],
        message: &str,
        signature: &[u8],
    ) -> Result<bool, EngineError> {
        Ok(public_keys.iter().any(|key| sign(key, message) == signature))
    }
}

const ALICE: i64 = 42;
const BOB: i64 = 43;
const PROPOSER: i64 = 77;
const COMMISSION_WALLET: i64 = 99;

fn alice_pub() -> Vec<u8> {
    vec![0xa1; 32]
}

fn storage_fixture() -> MemoryStorage {
    let mut storage = MemoryStorage::new();
    bootstrap_system_tables(&mut storage);
    bootstrap_ecosystem(&mut storage, 1);
    for (id, pubkey, amount) in [
        (ALICE, alice_pub(), "10000"),
        (BOB, vec![0xb2; 32], "50"),
        (PROPOSER, vec![0xc3; 32], "0"),
        (COMMISSION_WALLET, vec![0xd4; 32], "0"),
    ] {
        storage.seed_row(
            "1_keys",
            &[
                ("id", Value::Int(id)),
                ("pub", Value::Bytes(pubkey)),
                ("amount", Value::Text(amount.to_string())),
                ("rb_id", Value::Int(0)),
            ],
        );
    }
    storage
}

fn chain_params() -> ChainParams {
    let mut params = ChainParams::new();
    params.fuel_rates.insert(1, 1);
    params.commission_wallets.insert(1, COMMISSION_WALLET);
    params
}

fn transfer_program() -> ContractProgram {
    let mut program = ContractProgram::new("Transfer", 1);
    program.schema = vec![
        ParamSpec::new("recipient", ParamType::Int).address(),
        ParamSpec::new("amount", ParamType::Money),
    ];
    program.phases.set(
        Phase::Conditions,
        Arc::new(|env: &mut Environment<'_>| {
            let wallet = env.get("wallet").and_then(Value::as_int).unwrap_or(0);
            let amount = env.get("amount").and_then(Value::as_int).unwrap_or(0);
            let rows =
                builtins::db_select(env, "keys", &["amount"], &[("id", Value::Int(wallet))])?;
            let balance = rows
                .first()
                .and_then(|row| row.get("amount"))
                .and_then(Value::as_int)
                .unwrap_or(0);
            Ok(Value::Int((balance >= amount) as i64))
        }),
    );
    program.phases.set(
        Phase::Action,
        Arc::new(|env: &mut Environment<'_>| {
            let wallet = env.get("wallet").and_then(Value::as_int).unwrap_or(0);
            let recipient = env.get("recipient").and_then(Value::as_int).unwrap_or(0);
            let amount = env.get("amount").cloned().unwrap_or(Value::Null);
            builtins::db_update(env, "keys", wallet, &["-amount"], &[amount.clone()])?;
            builtins::db_update(env, "keys", recipient, &["+amount"], &[amount])?;
            Ok(Value::Int(1))
        }),
    );
    program
}

fn ctx_for(caller: i64, block: bool) -> TransactionContext {
    let mut builder = TransactionContext::builder()
        .with_tx_hash(b"engine-tx".to_vec())
        .with_tx_type(1)
        .with_time(1_600_000_000)
        .with_key_id(caller)
        .with_ecosystem(1)
        .with_token_ecosystem(1)
        .with_fuel_limit(100_000);
    if block {
        builder = builder.with_block(BlockContext {
            block_id: 5,
            time: 1_600_000_000,
            key_id: PROPOSER,
            ecosystem_id: 1,
            node_position: 0,
        });
    }
    builder.build()
}

fn amount_of(session: &dyn StorageSession, id: i64) -> i64 {
    session
        .query_row(&Select::all("1_keys").filter("id", Value::Int(id)))
        .unwrap()
        .unwrap()
        .get("amount")
        .and_then(Value::as_int)
        .unwrap()
}

#[test]
fn test_conditions_gate_actions() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();

    let action_ran = Arc::new(AtomicBool::new(false));
    let witness = action_ran.clone();
    let mut program = ContractProgram::new("Probe", 1);
    program
        .phases
        .set(Phase::Conditions, Arc::new(|_env| Ok(Value::Int(0))));
    program.phases.set(
        Phase::Action,
        Arc::new(move |_env| {
            witness.store(true, Ordering::SeqCst);
            Ok(Value::Int(1))
        }),
    );
    registry.publish(program);

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };
    let program = engine.resolve("Probe", 1, false).unwrap();
    let mut ctx = ctx_for(ALICE, true);

    let err = engine
        .call_contract(
            &mut ctx,
            &mut session,
            &program,
            CALL_INIT | CALL_CONDITIONS | CALL_ACTION,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Access(AccessError::Denied { .. })));
    assert!(!action_ran.load(Ordering::SeqCst), "action never runs");
    assert!(
        session.query_all(&Select::all("rollback")).unwrap().is_empty(),
        "no rollback record is created"
    );
}

#[test]
fn test_transfer_rejected_when_balance_is_short() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();
    registry.publish(transfer_program());

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };
    let program = engine.resolve("Transfer", 1, false).unwrap();

    // Bob holds 50 and tries to move 100
    let mut ctx = ctx_for(BOB, true);
    ctx.params
        .insert("recipient".to_string(), Value::Int(ALICE));
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));

    let err = engine
        .call_contract(
            &mut ctx,
            &mut session,
            &program,
            CALL_INIT | CALL_CONDITIONS | CALL_ACTION,
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Access(AccessError::Denied { .. })));
    assert_eq!(amount_of(&session, BOB), 50, "balance is untouched");
    assert_eq!(amount_of(&session, ALICE), 10_000);
}

#[test]
fn test_transfer_applies_and_settles_fee() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();
    registry.publish(transfer_program());

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };
    let program = engine.resolve("Transfer", 1, false).unwrap();

    let mut ctx = ctx_for(ALICE, true);
    ctx.params.insert("recipient".to_string(), Value::Int(BOB));
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));

    let total_before: i64 = [ALICE, BOB, PROPOSER, COMMISSION_WALLET]
        .iter()
        .map(|id| amount_of(&session, *id))
        .sum();

    engine
        .call_contract(
            &mut ctx,
            &mut session,
            &program,
            CALL_INIT | CALL_CONDITIONS | CALL_ACTION,
        )
        .unwrap();

    assert!(ctx.used_cost > 0, "metered cost is positive");
    assert_eq!(amount_of(&session, BOB), 150);
    let fee = ctx.used_cost; // fuel rate is 1
    assert_eq!(amount_of(&session, ALICE), 10_000 - 100 - fee);
    let commission = fee * params.commission_size / 100;
    assert_eq!(amount_of(&session, PROPOSER), fee - commission);
    assert_eq!(amount_of(&session, COMMISSION_WALLET), commission);

    let total_after: i64 = [ALICE, BOB, PROPOSER, COMMISSION_WALLET]
        .iter()
        .map(|id| amount_of(&session, *id))
        .sum();
    assert_eq!(total_before, total_after, "fees move value, never mint it");
}

#[test]
fn test_insufficient_funds_blocks_all_phases() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();

    let init_ran = Arc::new(AtomicBool::new(false));
    let witness = init_ran.clone();
    let mut program = ContractProgram::new("Probe", 1);
    program.phases.set(
        Phase::Init,
        Arc::new(move |_env| {
            witness.store(true, Ordering::SeqCst);
            Ok(Value::Int(1))
        }),
    );
    registry.publish(program);

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };
    let program = engine.resolve("Probe", 1, false).unwrap();

    // the proposer account holds a zero balance
    let mut ctx = ctx_for(PROPOSER, true);
    let err = engine
        .call_contract(
            &mut ctx,
            &mut session,
            &program,
            CALL_INIT | CALL_CONDITIONS | CALL_ACTION,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Contract(ContractError::InsufficientFunds)
    ));
    assert!(!init_ran.load(Ordering::SeqCst), "no phase executes");
}

#[test]
fn test_price_function_feeds_used_cost() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();

    let mut program = ContractProgram::new("Priced", 1);
    program.price = Some(Arc::new(|_env| Ok(Value::Int(25))));
    program
        .phases
        .set(Phase::Action, Arc::new(|_env| Ok(Value::Int(1))));
    registry.publish(program);

    let mut bad = ContractProgram::new("BadPrice", 1);
    bad.price = Some(Arc::new(|_env| Ok(Value::Text("not a number".to_string()))));
    registry.publish(bad);

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };

    let program = engine.resolve("Priced", 1, false).unwrap();
    let mut ctx = ctx_for(ALICE, true);
    engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap();
    assert!(ctx.used_cost >= 25, "custom price counts toward used cost");
    assert_eq!(ctx.fuel.price(), 25);

    let program = engine.resolve("BadPrice", 1, false).unwrap();
    let mut ctx = ctx_for(ALICE, true);
    let err = engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Contract(ContractError::BadPriceResult)
    ));
}

#[test]
fn test_signature_covers_declared_fields() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();

    let mut program = ContractProgram::new("Signed", 1);
    program.schema = vec![ParamSpec::new("note", ParamType::Text).signature()];
    program
        .phases
        .set(Phase::Action, Arc::new(|_env| Ok(Value::Int(1))));
    registry.publish(program);

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &DigestVerifier,
    };
    let program = engine.resolve("Signed", 1, false).unwrap();

    let mut ctx = ctx_for(ALICE, true);
    ctx.params
        .insert("note".to_string(), Value::Text("pay rent".to_string()));
    let message = engine.fields_to_sign(&program, &ctx);
    assert_eq!(message, format!("{},{},pay rent", ctx.time, ALICE));
    ctx.signature = sign(&alice_pub(), &message);
    engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap();

    // same signature over a tampered field no longer verifies
    let mut ctx = ctx_for(ALICE, true);
    ctx.params
        .insert("note".to_string(), Value::Text("pay rent twice".to_string()));
    ctx.signature = sign(&alice_pub(), &message);
    let err = engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Contract(ContractError::InvalidSignature)
    ));
}

#[test]
fn test_fuel_exhaustion_leaves_no_mutation() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let mut registry = ProgramRegistry::new();
    registry.publish(transfer_program());

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };
    let program = engine.resolve("Transfer", 1, false).unwrap();

    let mut ctx = ctx_for(ALICE, true);
    ctx.fuel = dste::FuelMeter::new(2);
    ctx.params.insert("recipient".to_string(), Value::Int(BOB));
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));

    let err = engine
        .call_contract(
            &mut ctx,
            &mut session,
            &program,
            CALL_INIT | CALL_CONDITIONS | CALL_ACTION,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Resource(ResourceError::FuelExhausted { .. })
    ));
    assert!(ctx.used_cost >= 0);
    assert_eq!(amount_of(&session, ALICE), 10_000);
    assert_eq!(amount_of(&session, BOB), 50);
}

#[test]
fn test_validator_update_binds_node_key() {
    let storage = &mut storage_fixture();
    let mut session = storage.session();
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let node_public = vec![0xee; 32];
    let mut params = chain_params();
    params.nodes.push(NodeInfo {
        position: 0,
        key_id: 500,
        public: node_public.clone(),
    });
    let mut registry = ProgramRegistry::new();

    let mut program = ContractProgram::new("UpdateValidators", 0);
    program
        .phases
        .set(Phase::Action, Arc::new(|_env| Ok(Value::Int(1))));
    registry.publish(program);

    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &DigestVerifier,
    };
    let program = engine.resolve("UpdateValidators", 0, false).unwrap();

    let mut ctx = TransactionContext::builder()
        .with_tx_hash(b"validator-tx".to_vec())
        .with_tx_type(TX_TYPE_VALIDATOR_UPDATE as i64)
        .with_time(1_600_000_000)
        .with_key_id(500)
        .with_ecosystem(0)
        .with_fuel_limit(100_000)
        .build();
    ctx.signature = sign(&node_public, &engine.fields_to_sign(&program, &ctx));
    engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap();

    // a caller outside the validator set has no key to bind to
    let mut ctx = TransactionContext::builder()
        .with_tx_type(TX_TYPE_VALIDATOR_UPDATE as i64)
        .with_key_id(501)
        .with_ecosystem(0)
        .with_fuel_limit(100_000)
        .build();
    let err = engine
        .call_contract(&mut ctx, &mut session, &program, CALL_ACTION)
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Contract(ContractError::MissingPublicKey { .. })
    ));
}

#[test]
fn test_declared_parameter_validation() {
    let evaluator = AccessEvaluator::new(Arc::new(PermitAll));
    let params = chain_params();
    let registry = ProgramRegistry::new();
    let engine = ContractEngine {
        registry: &registry,
        params: &params,
        evaluator: &evaluator,
        verifier: &AcceptAll,
    };

    let mut program = ContractProgram::new("Strict", 1);
    program.schema = vec![
        ParamSpec::new("recipient", ParamType::Int).address(),
        ParamSpec::new("amount", ParamType::Money),
        ParamSpec::new("memo", ParamType::Text).optional(),
    ];

    let mut ctx = ctx_for(ALICE, false);
    ctx.params.insert("recipient".to_string(), Value::Int(BOB));
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));
    let vars = engine.build_environment(&ctx, &program).unwrap();
    assert_eq!(vars.get("memo"), Some(&Value::Null), "optional may be empty");
    assert_eq!(vars.get("wallet"), Some(&Value::Int(ALICE)));
    assert_eq!(vars.get("state"), Some(&Value::Int(1)));

    // required field missing
    let mut ctx = ctx_for(ALICE, false);
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));
    assert!(engine.build_environment(&ctx, &program).is_err());

    // zero is not a valid account address
    let mut ctx = ctx_for(ALICE, false);
    ctx.params.insert("recipient".to_string(), Value::Int(0));
    ctx.params
        .insert("amount".to_string(), Value::Text("100".to_string()));
    assert!(engine.build_environment(&ctx, &program).is_err());

    // monetary values are decimal integers
    let mut ctx = ctx_for(ALICE, false);
    ctx.params.insert("recipient".to_string(), Value::Int(BOB));
    ctx.params
        .insert("amount".to_string(), Value::Text("12x".to_string()));
    assert!(engine.build_environment(&ctx, &program).is_err());
}
