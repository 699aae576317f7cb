use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use dispatch_core::{proto::MathArgs, types::Operation};
use dispatch_server::{
    backend::service::WorkerService,
    server::{
        LoadBalancer, config::ServerConfig, pool::worker::HandleState,
        transport::local::LocalConnector,
    },
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::runtime::Builder;

#[derive(Clone, Copy, Debug)]
struct DispatchBenchParams {
    backends: usize,
    concurrency: usize,
}

async fn start_dispatcher(backends: usize) -> Arc<LoadBalancer<LocalConnector>> {
    let connector = LocalConnector::new();
    let addresses: Vec<String> = (0..backends).map(|i| format!("local:{i}")).collect();
    for address in &addresses {
        connector.insert(address.as_str(), WorkerService::new());
    }

    let config = ServerConfig {
        queue_capacity: 1024,
        ..ServerConfig::default()
    };
    let lb = Arc::new(LoadBalancer::new(config, connector));
    for address in &addresses {
        lb.registration().register(address.as_str());
    }
    lb.pool().reconcile(&lb.registration().snapshot());

    for address in &addresses {
        let mut state = lb.pool().subscribe(address).expect("handle not started");
        state
            .wait_for(|s| *s == HandleState::Idle)
            .await
            .expect("handle stopped while starting");
    }
    lb
}

async fn run_dispatch_bench(lb: &Arc<LoadBalancer<LocalConnector>>, concurrency: usize) {
    let mut tasks = FuturesUnordered::new();

    for i in 0..concurrency {
        let service = lb.dispatch_service();
        let operation = if i % 2 == 0 {
            Operation::Add
        } else {
            Operation::Multiply
        };
        tasks.push(tokio::spawn(async move {
            service
                .dispatch(
                    operation,
                    MathArgs {
                        numbers: vec![10.0, 1.0],
                    },
                )
                .await
        }));
    }

    while let Some(res) = tasks.next().await {
        black_box(res.expect("task panicked").expect("dispatch failed").answer);
    }
}

fn dispatch_bench(c: &mut Criterion) {
    let backends_cases = [1, 4, 16];
    let concurrency_cases = [1, 16, 128];

    let mut cases = Vec::new();
    for &backends in &backends_cases {
        for &concurrency in &concurrency_cases {
            cases.push(DispatchBenchParams {
                backends,
                concurrency,
            });
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let lb = rt.block_on(start_dispatcher(params.backends));

        let mut group = c.benchmark_group("dispatch/local");
        group.throughput(Throughput::Elements(params.concurrency as u64));
        group.bench_function(
            format!(
                "backends/{}/conc/{}",
                params.backends, params.concurrency
            ),
            |b| {
                b.to_async(&rt)
                    .iter(|| run_dispatch_bench(&lb, params.concurrency));
            },
        );
        group.finish();

        rt.block_on(lb.shutdown());
    }
}

criterion_group!(dispatch_benches, dispatch_bench);
criterion_main!(dispatch_benches);
