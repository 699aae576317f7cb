//! Periodic reconciliation of the worker pool against the registration
//! directory.
//!
//! The coordinator is the only path by which newly registered backends reach
//! the pool: registration does not notify it. A backend therefore starts
//! receiving work within one interval of registering.

use crate::server::{
    pool::manager::{ReconcileSummary, WorkerPool},
    queue::RequestQueue,
    registration::Registration,
    telemetry::record_queue_depth,
    transport::Connector,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct Coordinator<C: Connector> {
    registration: Arc<Registration>,
    pool: Arc<WorkerPool<C>>,
    queue: RequestQueue,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<C: Connector> Coordinator<C> {
    pub const fn new(
        registration: Arc<Registration>,
        pool: Arc<WorkerPool<C>>,
        queue: RequestQueue,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registration,
            pool,
            queue,
            interval,
            shutdown,
        }
    }

    /// One pass: log state, then reconcile.
    pub fn tick(&self) -> ReconcileSummary {
        let depth = self.queue.len();
        tracing::info!("Requests: {depth}");
        tracing::info!("{}", self.registration.report());
        record_queue_depth(depth as u64);

        let summary = self.pool.reconcile(&self.registration.snapshot());
        if summary.spawned > 0 || summary.retired > 0 {
            tracing::info!("Reconciled pool: {summary}");
            tracing::debug!("{}", self.pool.report());
        }
        summary
    }

    /// Ticks every interval, starting immediately, until shut down.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        tracing::debug!("Coordinator stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(tracing::info_span!("coordinator")))
    }
}
