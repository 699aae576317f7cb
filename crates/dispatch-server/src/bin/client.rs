use anyhow::Context;
use clap::Parser;
use dispatch_core::{
    proto::{MathArgs, load_balancer_services_client::LoadBalancerServicesClient},
    types::{DEFAULT_DISPATCH_ADDR, Operation},
};
use dispatch_server::server::transport::grpc::endpoint_uri;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::{Duration, Instant};
use tonic::{codec::CompressionEncoding, transport::Endpoint};

/// Load generator for the dispatcher.
#[derive(Parser, Debug)]
#[command(name = "dispatch-client", version)]
struct ClientArgs {
    /// Dispatcher endpoint serving `LoadBalancerServices`.
    #[arg(long, env = "DISPATCH_ADDR", default_value_t = String::from(DEFAULT_DISPATCH_ADDR))]
    dispatch_addr: String,

    /// Concurrent client connections.
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// `Add` and `Multiply` calls issued per client.
    #[arg(long, default_value_t = 10)]
    calls: usize,
}

#[derive(Debug)]
struct BenchmarkResult {
    label: String,
    target_count: usize,
    succeeded: usize,
    duration: Duration,
}

impl BenchmarkResult {
    fn throughput(&self) -> f64 {
        self.succeeded as f64 / self.duration.as_secs_f64()
    }

    fn report(&self) {
        println!(
            "{:<25} | {:>8} target | {:>8} ok | {:>10.2} ms | {:>10.2} calls/sec",
            self.label,
            self.target_count,
            self.succeeded,
            self.duration.as_secs_f64() * 1000.0,
            self.throughput()
        );
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = ClientArgs::parse();

    let mut results = Vec::new();
    for operation in [Operation::Add, Operation::Multiply] {
        results.push(run_parallel_calls(&args, operation).await?);
    }

    println!("\n=== Benchmark Summary ===");
    for r in &results {
        r.report();
    }

    Ok(())
}

async fn run_parallel_calls(
    args: &ClientArgs,
    operation: Operation,
) -> anyhow::Result<BenchmarkResult> {
    let endpoint = Endpoint::from_shared(endpoint_uri(&args.dispatch_addr))?;
    let start = Instant::now();

    let mut tasks = FuturesUnordered::new();
    for client_id in 0..args.clients {
        let endpoint = endpoint.clone();
        let calls = args.calls;

        tasks.push(tokio::spawn(async move {
            let channel = endpoint
                .connect()
                .await
                .context("failed to reach dispatcher")?;
            let mut client = LoadBalancerServicesClient::new(channel)
                .send_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Zstd);

            let mut succeeded = 0;
            for call in 0..calls {
                let args = MathArgs {
                    numbers: vec![10.0, 1.0],
                };
                let reply = match operation {
                    Operation::Add => client.add(args).await,
                    Operation::Multiply => client.multiply(args).await,
                };
                match reply {
                    Ok(reply) => {
                        println!(
                            "client {client_id} call {call}: {operation}(10, 1) = {}",
                            reply.into_inner().answer
                        );
                        succeeded += 1;
                    }
                    Err(status) => {
                        eprintln!("client {client_id} call {call}: {operation} failed: {status}");
                    }
                }
            }

            Ok::<usize, anyhow::Error>(succeeded)
        }));
    }

    let mut succeeded = 0;
    while let Some(res) = tasks.next().await {
        succeeded += res??;
    }

    Ok(BenchmarkResult {
        label: format!("{operation} x{}", args.clients),
        target_count: args.clients * args.calls,
        succeeded,
        duration: start.elapsed(),
    })
}
