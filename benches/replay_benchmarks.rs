//! Benchmarks for block replay
//!
//! These benchmarks measure end-to-end application of one block through
//! fetch, verification, contract execution and commit, across block sizes.

use criterion::{
    criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use dste::{
    bootstrap_ecosystem, bootstrap_system_tables, encode_block, AccessEvaluator, BlockFetcher,
    BlockHeader, ChainError, ChainParams, ConditionCompiler, ContractProgram, EngineError,
    Environment, Fingerprinter, MemoryStorage, NodeInfo, ParamSpec, ParamType, ParsedTransaction,
    Phase, Predicate, ProgramRegistry, ReplayController, SignatureVerifier, Value,
    TX_TYPE_CONTRACT,
};
use std::collections::HashMap;
use std::sync::Arc;

const ALICE: i64 = 42;
const BOB: i64 = 43;
const NODE_KEY_ID: i64 = 77;

fn alice_pub() -> Vec<u8> {
    vec![0xa1; 32]
}

fn node_public() -> Vec<u8> {
    vec![0xee; 32]
}

fn genesis_hash() -> Vec<u8> {
    vec![0x11; 32]
}

fn sign(public: &[u8], message: &str) -> Vec<u8> {
    let mut data = public.to_vec();
    data.extend_from_slice(message.as_bytes());
    Fingerprinter::new().hash(&data).unwrap().0.to_vec()
}

struct DigestVerifier;

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

struct PermitAll;

impl ConditionCompiler for PermitAll {
    fn compile(&self, _source: &str, _ecosystem_id: i64) -> Result<Predicate, EngineError> {
        Ok(Arc::new(|_scope| Ok(true)))
    }
}

struct MapFetcher {
    blocks: HashMap<i64, Vec<u8>>,
}

impl BlockFetcher for MapFetcher {
    fn block_body(&self, _host: &str, block_id: i64) -> Result<Vec<u8>, EngineError> {
        self.blocks.get(&block_id).cloned().ok_or_else(|| {
            ChainError::Fetch {
                reason: format!("peer has no block {}", block_id),
            }
            .into()
        })
    }
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
            let rows = dste::builtins::db_select(
                env,
                "keys",
                &["amount"],
                &[("id", Value::Int(wallet))],
            )?;
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
            dste::builtins::db_update(env, "keys", wallet, &["-amount"], &[amount.clone()])?;
            dste::builtins::db_update(env, "keys", recipient, &["+amount"], &[amount])?;
            Ok(Value::Int(1))
        }),
    );
    program
}

fn storage_fixture() -> MemoryStorage {
    let mut storage = MemoryStorage::new();
    bootstrap_system_tables(&mut storage);
    bootstrap_ecosystem(&mut storage, 1);
    storage.seed_row(
        "blocks",
        &[
            ("id", Value::Int(1)),
            ("hash", Value::Bytes(genesis_hash())),
        ],
    );
    for (id, pubkey, amount) in [
        (ALICE, alice_pub(), "100000000"),
        (BOB, vec![0xb2; 32], "50"),
        (NODE_KEY_ID, vec![0xc3; 32], "0"),
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

fn transfer_tx(time: i64) -> Vec<u8> {
    let message = format!("{},{}", time, ALICE);
    ParsedTransaction {
        tx_type: TX_TYPE_CONTRACT,
        time,
        key_id: ALICE,
        ecosystem_id: 1,
        token_ecosystem: 1,
        max_fuel: 0,
        public_key: Vec::new(),
        signature: sign(&alice_pub(), &message),
        contract: "Transfer".to_string(),
        raw_params: vec![BOB.to_string().into_bytes(), b"1".to_vec()],
    }
    .encode()
}

fn build_block(block_id: i64, prev_hash: &[u8], time: i64, bodies: Vec<Vec<u8>>) -> Vec<u8> {
    let fp = Fingerprinter::new();
    let leaves: Vec<Vec<u8>> = fp
        .tx_fingerprints(&bodies)
        .unwrap()
        .iter()
        .map(|d| d.0.to_vec())
        .collect();
    let root = fp.merkle_root(&leaves).unwrap();
    let mut header = BlockHeader {
        version: 1,
        block_id,
        time,
        ecosystem_id: 1,
        key_id: NODE_KEY_ID,
        node_position: 0,
        sign: Vec::new(),
    };
    header.sign = sign(&node_public(), &header.for_sign(prev_hash, &root));
    encode_block(&header, &bodies)
}

fn bench_block_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_replay");
    for tx_count in [1usize, 8, 32] {
        group.throughput(Throughput::Elements(tx_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(tx_count),
            &tx_count,
            |b, &tx_count| {
                let time = 1_600_000_000;
                let bodies: Vec<Vec<u8>> = (0..tx_count)
                    .map(|i| transfer_tx(time + i as i64))
                    .collect();
                let block = build_block(2, &genesis_hash(), time, bodies);
                let storage = storage_fixture();

                let mut params = ChainParams::new();
                params.fuel_rates.insert(1, 1);
                params.nodes.push(NodeInfo {
                    position: 0,
                    key_id: NODE_KEY_ID,
                    public: node_public(),
                });
                let mut registry = ProgramRegistry::new();
                registry.publish(transfer_program());
                let mut controller = ReplayController::new(
                    params,
                    registry,
                    AccessEvaluator::new(Arc::new(PermitAll)),
                    Fingerprinter::new(),
                    Arc::new(DigestVerifier),
                    Arc::new(MapFetcher {
                        blocks: HashMap::from([(2, block)]),
                    }),
                );

                b.iter_batched(
                    || storage.clone(),
                    |mut storage| {
                        controller.replay_from(&mut storage, 2, "peer-a").unwrap();
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_block_replay);
criterion_main!(benches);
