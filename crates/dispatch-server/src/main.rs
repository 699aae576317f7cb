use clap::Parser;
use dispatch_server::server::{
    LoadBalancer,
    config::{CliArgs, ServerConfig},
    serve,
    signal::shutdown_signal,
    telemetry::init_telemetry,
    transport::grpc::GrpcConnector,
};
use std::sync::Arc;
use tokio::net::TcpListener;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry("dispatch-server")?;

    let dispatch_listener = TcpListener::bind(&config.dispatch_addr).await?;
    let registration_listener = TcpListener::bind(&config.registration_addr).await?;
    log_startup_info(&config);

    let connector = GrpcConnector::new(config.dial_timeout);
    let lb = Arc::new(LoadBalancer::new(config, connector));
    let result = serve(lb, dispatch_listener, registration_listener, shutdown_signal()).await;

    providers.shutdown();
    result
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Dispatching on {} (registration on {}) with full config: {:#?}",
            config.dispatch_addr,
            config.registration_addr,
            config
        );
    } else {
        tracing::info!(
            "Dispatching on {} (registration on {}), queue capacity {}",
            config.dispatch_addr,
            config.registration_addr,
            config.queue_capacity
        );
    }
}
