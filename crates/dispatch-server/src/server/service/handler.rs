//! gRPC front end of the dispatcher.
//!
//! [`DispatchService`] implements `LoadBalancerServices`. Each call becomes
//! one [`ServiceRequest`] on the shared queue; the call then waits for
//! whichever worker handle services it. There is no retry here: failed
//! attempts are retried by the handles, and the caller only ever sees the
//! final answer or a dispatcher-level error.

use crate::server::{
    queue::{RequestQueue, ServiceRequest},
    telemetry::{increment_request_errors, increment_requests, record_request_duration},
};
use core::time::Duration;
use dispatch_core::{
    Error,
    proto::{MathArgs, MathReply, load_balancer_services_server::LoadBalancerServices},
    types::Operation,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// Turns client calls into queued requests and waits for their results.
#[derive(Clone, Debug)]
pub struct DispatchService {
    queue: RequestQueue,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl DispatchService {
    /// `request_timeout` bounds each attempt on a backend, not the whole
    /// call. Calls are refused once `shutdown` is cancelled.
    pub const fn new(
        queue: RequestQueue,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            request_timeout,
            shutdown,
        }
    }

    /// Queues `operation` and waits for a handle to answer it.
    ///
    /// Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the dispatcher is shutting down.
    /// - [`Error::QueueClosed`] if the queue closed before the request was
    ///   answered.
    /// - [`Error::RetriesExhausted`] if an attempt limit is configured and
    ///   was reached.
    pub async fn dispatch(&self, operation: Operation, args: MathArgs) -> Result<MathReply, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let (request, reply) = ServiceRequest::new(operation, args, self.request_timeout);
        let id = request.id;
        self.queue.submit(request).await?;
        tracing::debug!("Queued {operation} request {id} ({} pending)", self.queue.len());

        match reply.await {
            Ok(result) => result,
            // The request was dropped unanswered, which only happens while
            // the queue is being torn down.
            Err(_) => Err(Error::QueueClosed),
        }
    }

    async fn handle(
        &self,
        operation: Operation,
        request: Request<MathArgs>,
    ) -> Result<Response<MathReply>, Status> {
        let start = std::time::Instant::now();
        increment_requests(operation.as_str());

        let result = self.dispatch(operation, request.into_inner()).await;
        record_request_duration(start.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(reply) => Ok(Response::new(reply)),
            Err(err) => {
                increment_request_errors();
                tracing::warn!("{operation} failed: {err}");
                Err(err.into())
            }
        }
    }
}

#[tonic::async_trait]
impl LoadBalancerServices for DispatchService {
    #[tracing::instrument(skip_all, fields(numbers = request.get_ref().numbers.len()))]
    async fn add(&self, request: Request<MathArgs>) -> Result<Response<MathReply>, Status> {
        self.handle(Operation::Add, request).await
    }

    #[tracing::instrument(skip_all, fields(numbers = request.get_ref().numbers.len()))]
    async fn multiply(&self, request: Request<MathArgs>) -> Result<Response<MathReply>, Status> {
        self.handle(Operation::Multiply, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(queue: &RequestQueue) -> (DispatchService, CancellationToken) {
        let shutdown = CancellationToken::new();
        let service = DispatchService::new(queue.clone(), Duration::from_secs(60), shutdown.clone());
        (service, shutdown)
    }

    #[tokio::test]
    async fn answers_with_the_reply_of_whichever_consumer_takes_the_request() {
        let queue = RequestQueue::new(4, None);
        let (service, _shutdown) = service(&queue);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let request = queue.recv().await.unwrap();
                assert_eq!(request.operation, Operation::Multiply);
                assert_eq!(request.timeout, Duration::from_secs(60));
                let answer = request.operation.apply(&request.args.numbers);
                request.respond(Ok(MathReply { answer }));
            })
        };

        let reply = service
            .multiply(Request::new(MathArgs {
                numbers: vec![10.0, 1.0],
            }))
            .await
            .unwrap();
        consumer.await.unwrap();
        assert_eq!(reply.into_inner().answer, 10.0);
    }

    #[tokio::test]
    async fn refuses_calls_after_shutdown() {
        let queue = RequestQueue::new(4, None);
        let (service, shutdown) = service(&queue);
        shutdown.cancel();

        let status = service
            .add(Request::new(MathArgs { numbers: vec![1.0] }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn closing_the_queue_fails_waiting_callers() {
        let queue = RequestQueue::new(4, None);
        let (service, _shutdown) = service(&queue);

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.dispatch(Operation::Add, MathArgs::default()).await })
        };
        while queue.is_empty() {
            tokio::task::yield_now().await;
        }
        queue.close();

        assert_eq!(call.await.unwrap(), Err(Error::QueueClosed));
    }

    #[tokio::test]
    async fn backend_errors_are_not_forwarded() {
        let queue = RequestQueue::new(4, None);
        let (service, _shutdown) = service(&queue);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let request = queue.recv().await.unwrap();
                request.respond(Err(Error::Call {
                    address: "10.0.0.1:9000".into(),
                    reason: "secret stack trace".into(),
                }));
            })
        };

        let status = service
            .add(Request::new(MathArgs { numbers: vec![1.0] }))
            .await
            .unwrap_err();
        consumer.await.unwrap();
        assert!(!status.message().contains("secret"));
    }
}
