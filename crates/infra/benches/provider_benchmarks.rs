use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskdrain_core::{Clock, Job, ManualClock};
use taskdrain_infra::config::{BatchSettings, QueueConfig};
use taskdrain_infra::provider::{InMemoryProvider, Provider};
use taskdrain_infra::runtime::QueueRuntime;
use taskdrain_infra::scheduler::triggers_needed;

fn job(n: usize) -> Job {
    Job::typed("bench", serde_json::json!({ "n": n }))
}

fn filled_provider(jobs: usize) -> InMemoryProvider {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let provider = InMemoryProvider::new(clock, Duration::from_secs(300));
    for n in 0..jobs {
        provider.push(job(n)).unwrap();
    }
    provider
}

fn bench_push_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &n| {
            b.iter(|| {
                let provider = filled_provider(0);
                for i in 0..n {
                    black_box(provider.push(job(i)).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_pop_from_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("pop_from_backlog");

    for backlog in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(100));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &n| {
            b.iter_batched(
                || filled_provider(n),
                |provider| black_box(provider.pop("default", 100).unwrap().len()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_pending_count(c: &mut Criterion) {
    let provider = filled_provider(10_000);
    provider.pop("default", 5_000).unwrap();

    c.bench_function("pending_count_10k", |b| {
        b.iter(|| black_box(provider.pending_count("default").unwrap()));
    });
}

fn bench_sizing(c: &mut Criterion) {
    let settings = BatchSettings {
        batch_size: 100,
        max_concurrent_batches: 8,
        base_delay: Duration::ZERO,
    };

    c.bench_function("triggers_needed", |b| {
        b.iter(|| {
            for pending in 0..1_000usize {
                black_box(triggers_needed(black_box(pending), 3, &settings));
            }
        });
    });
}

fn bench_drain_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_cycle");
    group.sample_size(20);

    for jobs in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), jobs, |b, &n| {
            b.iter(|| {
                let clock = Arc::new(ManualClock::new(Utc::now()));
                let mut config = QueueConfig::default();
                config.defaults.max_concurrent_batches = 4;
                let rt = QueueRuntime::with_clock(config, clock.clone());
                rt.handlers.register_fn("bench", |_| Ok(()));

                for i in 0..n {
                    rt.dispatcher.dispatch(job(i)).unwrap();
                }
                rt.finish_request();

                while !rt.triggers.is_empty() {
                    clock.advance(Duration::from_secs(60));
                    rt.fire_due();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_push_throughput,
    bench_pop_from_backlog,
    bench_pending_count,
    bench_sizing,
    bench_drain_cycle
);
criterion_main!(benches);
