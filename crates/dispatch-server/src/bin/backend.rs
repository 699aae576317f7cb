use clap::Parser;
use dispatch_server::{
    backend::{
        self,
        config::{BackendArgs, BackendConfig},
        service::WorkerService,
    },
    server::{signal::shutdown_signal, telemetry::init_telemetry},
};
use tokio::net::TcpListener;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = BackendConfig::try_from(BackendArgs::parse())?;

    let providers = init_telemetry("dispatch-backend")?;

    let listener = TcpListener::bind(&config.backend_addr).await?;
    tracing::info!(
        "Backend listening on {}, registering with {}",
        listener.local_addr()?,
        config.registration_addr
    );

    let result = backend::run(config, listener, WorkerService::new(), shutdown_signal()).await;
    if let Err(err) = &result {
        tracing::error!("Backend exiting: {err:#}");
    }

    providers.shutdown();
    result
}
