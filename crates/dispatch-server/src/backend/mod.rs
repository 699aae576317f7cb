//! The backend worker process: serves `WorkerServices`, registers with the
//! dispatcher and keeps pinging it.
//!
//! ## Structure
//!
//! - [`config`] - CLI/env configuration.
//! - [`service`] - the `WorkerServices` implementation.
//! - [`registrar`] - registration and heartbeat against the dispatcher.

pub mod config;
pub mod registrar;
pub mod service;

use config::BackendConfig;
use dispatch_core::proto::worker_services_server::WorkerServicesServer;
use registrar::Registrar;
use service::WorkerService;
use std::future::Future;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{codec::CompressionEncoding, transport::Server};

/// Serves `service` on `listener`, registers the bound address and keeps
/// heartbeating until `shutdown` resolves or the dispatcher stops answering.
///
/// # Errors
///
/// Returns an error if registration fails, the heartbeat fails, or the
/// server fails.
pub async fn run<F>(
    config: BackendConfig,
    listener: TcpListener,
    service: WorkerService,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let address = listener.local_addr()?.to_string();

    let (health, health_service) = tonic_health::server::health_reporter();
    health
        .set_serving::<WorkerServicesServer<WorkerService>>()
        .await;

    let stop = CancellationToken::new();
    let server = Server::builder()
        .add_service(health_service)
        .add_service(
            WorkerServicesServer::new(service)
                .send_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Zstd),
        )
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            stop.clone().cancelled_owned(),
        );
    let mut server_task = tokio::spawn(server);
    tracing::info!("Serving WorkerServices on {address}");

    let registrar = Registrar::connect(&config, address).await?;
    registrar.register().await?;

    let mut server_exit = None;
    let outcome = tokio::select! {
        () = shutdown => Ok(()),
        result = registrar.heartbeat() => result,
        exit = &mut server_task => {
            server_exit = Some(exit);
            Err(anyhow::anyhow!("WorkerServices server exited unexpectedly"))
        }
    };

    health
        .set_not_serving::<WorkerServicesServer<WorkerService>>()
        .await;
    stop.cancel();
    let server_exit = match server_exit {
        Some(exit) => exit,
        None => server_task.await,
    };
    server_exit??;

    tracing::info!("Backend shut down");
    outcome
}
