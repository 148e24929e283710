//! Throughput of the engine across conflict levels and thread counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use exec_test::{Executor, ParallelExecutor, SequentialExecutor, Workload, WorkloadConfig};
use std::sync::Arc;

/// Sequential baseline against a 4-thread pool at each conflict level.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_transfer/conflict_levels");

    let conflict_factors = [0.0, 0.25, 0.5, 0.75, 1.0];
    let num_transactions = 1000;
    let sequential = SequentialExecutor::new().unwrap();
    let parallel = ParallelExecutor::new(4).unwrap();

    for &conflict_factor in &conflict_factors {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 1000,
            num_transactions,
            conflict_factor,
            ..Default::default()
        });
        let label = format!("conflict_{:.0}%", conflict_factor * 100.0);

        group.throughput(Throughput::Elements(num_transactions as u64));
        for executor in [&sequential as &dyn Executor, &parallel] {
            group.bench_with_input(
                BenchmarkId::new(executor.name(), &label),
                &workload,
                |b, workload| {
                    b.iter(|| {
                        let kernel = Arc::new(workload.create_kernel());
                        let result = executor.execute(kernel, black_box(workload)).unwrap();
                        result.successful
                    });
                },
            );
        }
    }

    group.finish();
}

/// Scaling of a conflict-free workload with the number of executor threads.
fn bench_thread_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_transfer/thread_counts");

    let num_transactions = 2000;
    let workload = Workload::generate(WorkloadConfig {
        num_accounts: 10_000,
        num_transactions,
        ..Default::default()
    });

    for threads in [1, 2, 4, 8] {
        let executor = ParallelExecutor::new(threads).unwrap();
        group.throughput(Throughput::Elements(num_transactions as u64));
        group.bench_with_input(BenchmarkId::new("parallel", threads), &workload, |b, workload| {
            b.iter(|| {
                let kernel = Arc::new(workload.create_kernel());
                executor.execute(kernel, black_box(workload)).unwrap().successful
            });
        });
    }

    group.finish();
}

/// Contract-heavy workloads exercise the hot cache and storage writes.
fn bench_contract_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_transfer/contract_calls");

    let num_transactions = 1000;
    let executor = ParallelExecutor::new(4).unwrap();

    for contract_factor in [0.0, 0.5, 1.0] {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 1000,
            num_transactions,
            contract_factor,
            num_contracts: 16,
            ..Default::default()
        });

        group.throughput(Throughput::Elements(num_transactions as u64));
        group.bench_with_input(
            BenchmarkId::new("parallel", format!("contracts_{:.0}%", contract_factor * 100.0)),
            &workload,
            |b, workload| {
                b.iter(|| {
                    let kernel = Arc::new(workload.create_kernel());
                    executor.execute(kernel, black_box(workload)).unwrap().successful
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_conflict_levels,
    bench_thread_counts,
    bench_contract_calls
);
criterion_main!(benches);
