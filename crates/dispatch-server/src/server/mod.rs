//! The dispatcher process.
//!
//! ## Structure
//!
//! - [`config`] - CLI/env configuration.
//! - [`queue`] - shared bounded request queue.
//! - [`registration`] - backend directory and its gRPC service.
//! - [`pool`] - worker handles and the pool that owns them.
//! - [`service`] - client-facing `LoadBalancerServices`.
//! - [`coordinator`] - periodic pool reconciliation.
//! - [`dispatcher`] - [`LoadBalancer`], the above wired together.
//! - [`transport`] - how handles reach backends.
//! - [`telemetry`] - logging, tracing and metrics setup.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod registration;
pub mod service;
pub mod signal;
pub mod telemetry;
pub mod transport;


pub use dispatcher::LoadBalancer;

use dispatch_core::proto::{
    FILE_DESCRIPTOR_SET, load_balancer_services_server::LoadBalancerServicesServer,
    registration_service_server::RegistrationServiceServer,
};
use registration::RegistrationHandler;
use service::handler::DispatchService;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use transport::Connector;

/// Serves the dispatch and registration endpoints on the given listeners
/// until `shutdown` resolves, then shuts `lb` down and drains both servers.
///
/// The dispatch endpoint also serves gRPC health, reflection and gRPC-Web;
/// the registration endpoint serves gRPC health.
///
/// # Errors
///
/// Returns an error if reflection cannot be built or either server fails.
pub async fn serve<C, F>(
    lb: Arc<LoadBalancer<C>>,
    dispatch_listener: TcpListener,
    registration_listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    C: Connector,
    F: Future<Output = ()>,
{
    let (dispatch_health, dispatch_health_service) = tonic_health::server::health_reporter();
    dispatch_health
        .set_serving::<LoadBalancerServicesServer<DispatchService>>()
        .await;
    let (registration_health, registration_health_service) =
        tonic_health::server::health_reporter();
    registration_health
        .set_serving::<RegistrationServiceServer<RegistrationHandler>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let servers_stop = CancellationToken::new();

    let dispatch_server = Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(dispatch_health_service)
        .add_service(reflection)
        .add_service(build_dispatch_service(lb.dispatch_service()))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(dispatch_listener),
            servers_stop.clone().cancelled_owned(),
        );

    let registration_server = Server::builder()
        .add_service(registration_health_service)
        .add_service(RegistrationServiceServer::new(lb.registration_service()))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(registration_listener),
            servers_stop.clone().cancelled_owned(),
        );

    let mut dispatch_task = tokio::spawn(dispatch_server);
    let mut registration_task = tokio::spawn(registration_server);
    lb.start();

    let mut dispatch_exit = None;
    let mut registration_exit = None;
    tokio::select! {
        () = shutdown => {}
        exit = &mut dispatch_task => {
            tracing::error!("Dispatch server exited unexpectedly");
            dispatch_exit = Some(exit);
        }
        exit = &mut registration_task => {
            tracing::error!("Registration server exited unexpectedly");
            registration_exit = Some(exit);
        }
    }

    // 1. Publish the status
    dispatch_health
        .set_not_serving::<LoadBalancerServicesServer<DispatchService>>()
        .await;
    registration_health
        .set_not_serving::<RegistrationServiceServer<RegistrationHandler>>()
        .await;

    // 2. Stop handles and fail whatever is still queued
    lb.shutdown().await;

    // 3. Stop listening once pending calls have their answers
    servers_stop.cancel();
    let dispatch_exit = match dispatch_exit {
        Some(exit) => exit,
        None => dispatch_task.await,
    };
    let registration_exit = match registration_exit {
        Some(exit) => exit,
        None => registration_task.await,
    };
    dispatch_exit??;
    registration_exit??;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn build_dispatch_service(service: DispatchService) -> LoadBalancerServicesServer<DispatchService> {
    LoadBalancerServicesServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}
