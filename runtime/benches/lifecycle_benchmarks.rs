//! Lifecycle benchmarks: invoke-to-settle overhead
//!
//! Measures the cost the engine adds around a work function that returns
//! immediately, with and without a host container and guard rails.
//!
//! Run with: `cargo bench --bench lifecycle_benchmarks`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use composable_ops_core::{ErrorNormalizer, LifecycleEvent, Thrown};
use composable_ops_runtime::{
    AsyncOperation, Dispatcher, DispatcherConfig, InvokeContext, OperationApi,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Benchmark Fixtures
// ============================================================================

type BenchEvent = LifecycleEvent<u64, u64, String>;

fn increment() -> AsyncOperation<u64, u64, String, u64> {
    AsyncOperation::new(
        "bench/increment",
        |n: u64, api: OperationApi<u64, (), String>| async move { Ok(api.fulfill(n + 1)) },
    )
}

fn discarding_context() -> InvokeContext<u64, (), BenchEvent> {
    InvokeContext::new(Arc::new(|_: BenchEvent| {}), Arc::new(|| 0_u64), ())
}

fn counting_dispatcher(guard_rails: bool) -> Dispatcher<u64, BenchEvent> {
    Dispatcher::with_default_auditors(
        0,
        |settled: &mut u64, event: &BenchEvent| {
            if event.is_terminal() {
                *settled += 1;
            }
        },
        DispatcherConfig::default().with_guard_rails(guard_rails),
    )
}

// ============================================================================
// Benchmarks
// ============================================================================

/// Single invocation against a sink that drops every event
fn bench_invoke_to_settle(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke_to_settle");
    group.measurement_time(Duration::from_secs(10));

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let operation = increment();
    let context = discarding_context();

    group.bench_function("discarding_sink", |b| {
        b.to_async(&runtime).iter(|| async {
            let handle = operation.invoke(black_box(1), &context);
            black_box(handle.settled().await);
        });
    });

    for guard_rails in [false, true] {
        let dispatcher = counting_dispatcher(guard_rails);
        let context = dispatcher.context(());
        group.bench_with_input(
            BenchmarkId::new("dispatcher", if guard_rails { "audited" } else { "plain" }),
            &context,
            |b, context| {
                b.to_async(&runtime).iter(|| async {
                    let handle = operation.invoke(black_box(1), context);
                    black_box(handle.settled().await);
                });
            },
        );
    }

    group.finish();
}

/// Many concurrent invocations settled together
fn bench_concurrent_invocations(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_invocations");
    group.measurement_time(Duration::from_secs(10));

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let operation = increment();
    let context = discarding_context();

    for count in [10_u64, 100, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&runtime).iter(|| async {
                let handles: Vec<_> = (0..count).map(|n| operation.invoke(n, &context)).collect();
                for handle in handles {
                    black_box(handle.settled().await);
                }
            });
        });
    }

    group.finish();
}

/// Abort issued right after invoking
fn bench_abort(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    let operation: AsyncOperation<u64, u64, String, u64> = AsyncOperation::new(
        "bench/until_aborted",
        |_: u64, api: OperationApi<u64, (), String>| async move {
            api.signal().aborted().await;
            Err(Thrown::named("AbortError", "bench"))
        },
    );
    let context = discarding_context();

    c.bench_function("abort_pending_invocation", |b| {
        b.to_async(&runtime).iter(|| async {
            let handle = operation.invoke(black_box(1), &context);
            handle.abort(Some("bench"));
            black_box(handle.settled().await);
        });
    });
}

/// Error normalization alone
fn bench_normalize(c: &mut Criterion) {
    let normalizer = ErrorNormalizer::new().with_strip_stack(true);

    c.bench_function("normalize_error_like_value", |b| {
        b.iter(|| {
            let thrown = Thrown::named("LookupError", "missing").with_code("E404");
            black_box(normalizer.normalize(black_box(&thrown)))
        });
    });
}

criterion_group!(
    benches,
    bench_invoke_to_settle,
    bench_concurrent_invocations,
    bench_abort,
    bench_normalize,
);
criterion_main!(benches);
