//! Benchmarks for the mutation journal
//!
//! These benchmarks measure:
//! - Logged write throughput with pre-image capture
//! - Undo cost when walking a row's rollback chain backward

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use dste::{
    bootstrap_ecosystem, bootstrap_system_tables, log_and_write, undo_row, BlockContext,
    MemoryStorage, TransactionContext, Value,
};

fn storage_fixture() -> MemoryStorage {
    let mut storage = MemoryStorage::new();
    bootstrap_system_tables(&mut storage);
    bootstrap_ecosystem(&mut storage, 1);
    storage.seed_row(
        "1_keys",
        &[
            ("id", Value::Int(7)),
            ("pub", Value::Bytes(vec![1, 2, 3])),
            ("amount", Value::Text("1000000".to_string())),
            ("rb_id", Value::Int(0)),
        ],
    );
    storage
}

fn ctx_in_block() -> TransactionContext {
    TransactionContext::builder()
        .with_tx_hash(b"bench-tx".to_vec())
        .with_ecosystem(1)
        .with_fuel_limit(i64::MAX / 2)
        .with_block(BlockContext {
            block_id: 5,
            time: 1_600_000_000,
            key_id: 77,
            ecosystem_id: 1,
            node_position: 0,
        })
        .build()
}

fn by_id(id: i64) -> Vec<(String, Value)> {
    vec![("id".to_string(), Value::Int(id))]
}

fn bench_logged_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_log_and_write");
    for writes in [1usize, 16, 64] {
        group.throughput(Throughput::Elements(writes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writes), &writes, |b, &writes| {
            b.iter_batched(
                storage_fixture,
                |mut storage| {
                    let mut session = storage.session();
                    let mut ctx = ctx_in_block();
                    for _ in 0..writes {
                        log_and_write(
                            &mut session,
                            &mut ctx,
                            "1_keys",
                            &["-amount"],
                            &[Value::Int(1)],
                            &by_id(7),
                            true,
                        )
                        .unwrap();
                    }
                    black_box(ctx.fuel.used())
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_undo_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_undo_chain");
    for depth in [1usize, 16, 64] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    let mut storage = storage_fixture();
                    {
                        let mut session = storage.session();
                        let mut ctx = ctx_in_block();
                        for _ in 0..depth {
                            log_and_write(
                                &mut session,
                                &mut ctx,
                                "1_keys",
                                &["-amount"],
                                &[Value::Int(1)],
                                &by_id(7),
                                true,
                            )
                            .unwrap();
                        }
                        session.commit().unwrap();
                    }
                    storage
                },
                |mut storage| {
                    let mut session = storage.session();
                    for _ in 0..depth {
                        undo_row(&mut session, "1_keys", 7).unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_logged_writes, bench_undo_chain);
criterion_main!(benches);
