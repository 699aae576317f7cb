//! `WorkerServices` implementation executed by backend processes.
//!
//! The arithmetic is deliberately trivial; it stands in for an arbitrary unit
//! of work routed through the dispatcher.

use dispatch_core::{
    proto::{MathArgs, MathReply, PingArgs, PingReply, worker_services_server::WorkerServices},
    types::Operation,
};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Backend-side service answering pings and arithmetic calls.
///
/// Clones share the same served-call counter.
#[derive(Clone, Debug, Default)]
pub struct WorkerService {
    served: Arc<AtomicU64>,
}

impl WorkerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of arithmetic calls answered so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    fn compute(&self, operation: Operation, args: MathArgs) -> MathReply {
        tracing::debug!("Received {operation} {:?}", args.numbers);
        let answer = operation.apply(&args.numbers);
        self.served.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Replying {operation} {:?}: {answer}", args.numbers);
        MathReply { answer }
    }
}

#[tonic::async_trait]
impl WorkerServices for WorkerService {
    async fn ping(&self, request: Request<PingArgs>) -> Result<Response<PingReply>, Status> {
        let PingArgs { from } = request.into_inner();
        tracing::trace!("Received Ping from {from}");
        Ok(Response::new(PingReply { from }))
    }

    async fn add(&self, request: Request<MathArgs>) -> Result<Response<MathReply>, Status> {
        Ok(Response::new(self.compute(Operation::Add, request.into_inner())))
    }

    async fn multiply(&self, request: Request<MathArgs>) -> Result<Response<MathReply>, Status> {
        Ok(Response::new(
            self.compute(Operation::Multiply, request.into_inner()),
        ))
    }
}
