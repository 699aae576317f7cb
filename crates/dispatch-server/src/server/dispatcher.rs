//! The dispatcher as one unit: queue, registration directory, worker pool and
//! coordinator, wired together and shut down together.

use crate::server::{
    config::ServerConfig,
    coordinator::Coordinator,
    pool::manager::{PoolConfig, WorkerPool},
    queue::RequestQueue,
    registration::{Registration, RegistrationHandler},
    service::handler::DispatchService,
    transport::Connector,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct LoadBalancer<C: Connector> {
    config: ServerConfig,
    registration: Arc<Registration>,
    queue: RequestQueue,
    pool: Arc<WorkerPool<C>>,
    shutdown: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> LoadBalancer<C> {
    pub fn new(config: ServerConfig, connector: C) -> Self {
        let queue = RequestQueue::new(config.queue_capacity, config.max_attempts);
        let pool = WorkerPool::new(
            Arc::new(connector),
            queue.clone(),
            PoolConfig::from(&config),
        );

        Self {
            config,
            registration: Arc::new(Registration::new()),
            queue,
            pool: Arc::new(pool),
            shutdown: CancellationToken::new(),
            coordinator: Mutex::new(None),
        }
    }

    /// Client-facing `LoadBalancerServices` implementation.
    pub fn dispatch_service(&self) -> DispatchService {
        DispatchService::new(
            self.queue.clone(),
            self.config.request_timeout,
            self.shutdown.clone(),
        )
    }

    /// `RegistrationService` implementation backends register through.
    pub fn registration_service(&self) -> RegistrationHandler {
        RegistrationHandler::new(Arc::clone(&self.registration))
    }

    pub fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    pub fn pool(&self) -> &Arc<WorkerPool<C>> {
        &self.pool
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Starts the coordinator loop. Calling it again has no effect.
    pub fn start(&self) {
        let mut coordinator = self.coordinator.lock();
        if coordinator.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let task = Coordinator::new(
            Arc::clone(&self.registration),
            Arc::clone(&self.pool),
            self.queue.clone(),
            self.config.coordinator_interval,
            self.shutdown.clone(),
        )
        .spawn();
        *coordinator = Some(task);
    }

    /// Shuts the dispatcher down:
    ///
    /// 1. refuse new calls and stop the coordinator;
    /// 2. stop every handle, which requeues whatever it holds;
    /// 3. close the queue, failing every request still waiting.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        tracing::info!("Refusing new requests");
        self.shutdown.cancel();

        let coordinator = self.coordinator.lock().take();
        if let Some(task) = coordinator {
            if let Err(err) = task.await {
                tracing::error!("Coordinator task failed: {err}");
            }
        }

        self.pool.shutdown().await;

        let failed = self.queue.close();
        if failed > 0 {
            tracing::warn!("Failed {failed} queued requests on shutdown");
        }
        tracing::info!("Dispatcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::service::WorkerService, server::transport::local::LocalConnector};
    use dispatch_core::{Error, proto::MathArgs, types::Operation};

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_refuses_new_calls() {
        let connector = LocalConnector::new();
        connector.insert("a", WorkerService::new());
        let lb = LoadBalancer::new(ServerConfig::default(), connector);
        lb.registration().register("a");
        lb.start();
        lb.start();

        lb.shutdown().await;
        lb.shutdown().await;

        assert!(lb.is_shutting_down());
        assert!(lb.queue().is_closed());
        assert_eq!(
            lb.dispatch_service()
                .dispatch(Operation::Add, MathArgs::default())
                .await,
            Err(Error::ServiceShutdown)
        );
    }
}
