//! Shared request queue between the dispatch front end and worker handles.
//!
//! Every client call becomes exactly one [`ServiceRequest`] on a bounded
//! multi-producer/multi-consumer channel. The front end submits, every worker
//! handle receives; whichever handle is ready first takes the next request.
//! Once the queue holds its capacity, submitters wait for a free slot.
//!
//! A request that failed on one backend is [`requeue`](RequestQueue::requeue)d
//! so another handle can retry it. Requeueing never blocks the handle doing
//! it: when the queue is full the push is handed to a detached task, so a
//! handle that is the queue's only consumer cannot deadlock on its own push.

use crate::server::telemetry::{increment_requeues, record_retries_exhausted};
use async_channel::{Receiver, Sender, TrySendError};
use core::{fmt, time::Duration};
use dispatch_core::{
    Error, Result,
    proto::{MathArgs, MathReply},
    types::Operation,
};
use portable_atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of work waiting for, or held by, a worker handle.
///
/// The reply channel has exactly one writer (whichever handle finishes the
/// request) and one reader (the front-end call that created it).
pub struct ServiceRequest {
    pub id: u64,
    pub operation: Operation,
    pub args: MathArgs,
    pub timeout: Duration,
    /// Failed attempts so far.
    pub attempts: u32,
    respond_to: oneshot::Sender<Result<MathReply>>,
}

impl ServiceRequest {
    /// Creates a request and the receiver its result will arrive on.
    pub fn new(
        operation: Operation,
        args: MathArgs,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Result<MathReply>>) {
        let (respond_to, rx) = oneshot::channel();
        let request = Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            operation,
            args,
            timeout,
            attempts: 0,
            respond_to,
        };
        (request, rx)
    }

    /// Delivers the final result to the caller, consuming the request.
    ///
    /// Returns `false` if the caller is no longer waiting.
    pub fn respond(self, result: Result<MathReply>) -> bool {
        self.respond_to.send(result).is_ok()
    }
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("numbers", &self.args.numbers)
            .field("timeout", &self.timeout)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Bounded MPMC queue of pending [`ServiceRequest`]s.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    tx: Sender<ServiceRequest>,
    rx: Receiver<ServiceRequest>,
    max_attempts: Option<u32>,
}

impl RequestQueue {
    /// Creates a queue holding at most `capacity` requests. With
    /// `max_attempts` set, a request failing that many times is answered with
    /// [`Error::RetriesExhausted`] instead of being requeued again.
    pub fn new(capacity: usize, max_attempts: Option<u32>) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            tx,
            rx,
            max_attempts,
        }
    }

    /// Enqueues a new request, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] once the queue has been closed. The
    /// request is answered with the same error before it is dropped.
    pub async fn submit(&self, request: ServiceRequest) -> Result<()> {
        match self.tx.send(request).await {
            Ok(()) => Ok(()),
            Err(err) => {
                err.into_inner().respond(Err(Error::QueueClosed));
                Err(Error::QueueClosed)
            }
        }
    }

    /// Waits for the next request. Returns `None` once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<ServiceRequest> {
        self.rx.recv().await.ok()
    }

    /// Puts a request that failed on one backend back on the queue.
    ///
    /// Counts the failed attempt first; if that exhausts `max_attempts` the
    /// caller is answered with [`Error::RetriesExhausted`] instead.
    pub fn requeue(&self, mut request: ServiceRequest) {
        request.attempts += 1;

        if let Some(max_attempts) = self.max_attempts {
            if request.attempts >= max_attempts {
                tracing::warn!(
                    "Request {} abandoned after {} attempts",
                    request.id,
                    request.attempts
                );
                record_retries_exhausted();
                let attempts = request.attempts;
                request.respond(Err(Error::RetriesExhausted { attempts }));
                return;
            }
        }

        increment_requeues();
        self.push_back(request);
    }

    /// Puts back a request whose handle was stopped while servicing it.
    ///
    /// No backend failed, so the attempt is not counted.
    pub fn release(&self, request: ServiceRequest) {
        tracing::debug!("Releasing request {} after attempt {}", request.id, request.attempts + 1);
        self.push_back(request);
    }

    fn push_back(&self, request: ServiceRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {
                tracing::debug!("Requeued request ({} pending)", self.len());
            }
            Err(TrySendError::Full(request)) => {
                tracing::debug!("Queue full, requeueing request {} in background", request.id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = tx.send(request).await {
                        err.into_inner().respond(Err(Error::QueueClosed));
                    }
                });
            }
            Err(TrySendError::Closed(request)) => {
                request.respond(Err(Error::QueueClosed));
            }
        }
    }

    /// Requests currently waiting to be picked up.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stops accepting requests and answers everything still waiting with
    /// [`Error::QueueClosed`]. Returns the number of requests failed this way.
    pub fn close(&self) -> usize {
        self.tx.close();

        let mut failed = 0;
        while let Ok(request) = self.rx.try_recv() {
            request.respond(Err(Error::QueueClosed));
            failed += 1;
        }
        failed
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("max_attempts", &self.max_attempts)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn request(numbers: &[f64]) -> (ServiceRequest, oneshot::Receiver<Result<MathReply>>) {
        ServiceRequest::new(
            Operation::Add,
            MathArgs {
                numbers: numbers.to_vec(),
            },
            Duration::from_secs(60),
        )
    }

    #[test]
    fn request_ids_are_unique() {
        let (a, _ra) = request(&[1.0]);
        let (b, _rb) = request(&[1.0]);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn preserves_order_for_single_producer_and_consumer() {
        let queue = RequestQueue::new(8, None);
        for n in 0..5 {
            let (req, _rx) = request(&[f64::from(n)]);
            queue.submit(req).await.unwrap();
        }
        for n in 0..5 {
            let req = queue.recv().await.unwrap();
            assert_eq!(req.args.numbers, vec![f64::from(n)]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_submitters_until_a_slot_frees() {
        let queue = RequestQueue::new(2, None);
        let mut receivers = Vec::new();
        for _ in 0..2 {
            let (req, rx) = request(&[1.0]);
            queue.submit(req).await.unwrap();
            receivers.push(rx);
        }
        assert_eq!(queue.len(), queue.capacity());

        let (blocked, _rx) = request(&[2.0]);
        let submitter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit(blocked).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!submitter.is_finished());

        let _taken = queue.recv().await.unwrap();
        timeout(Duration::from_secs(1), submitter)
            .await
            .expect("submit should complete once a slot frees")
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn requeue_counts_attempts() {
        let queue = RequestQueue::new(4, None);
        let (req, _rx) = request(&[1.0]);
        queue.requeue(req);
        queue.requeue(queue.recv().await.unwrap());
        assert_eq!(queue.recv().await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn requeue_on_full_queue_does_not_block() {
        let queue = RequestQueue::new(1, None);
        let (first, _r1) = request(&[1.0]);
        queue.submit(first).await.unwrap();

        let (second, _r2) = request(&[2.0]);
        queue.requeue(second);
        assert_eq!(queue.len(), 1);

        // Draining lets the background push land.
        let a = queue.recv().await.unwrap();
        let b = queue.recv().await.unwrap();
        assert_eq!(a.args.numbers, vec![1.0]);
        assert_eq!(b.args.numbers, vec![2.0]);
        assert_eq!(b.attempts, 1);
    }

    #[tokio::test]
    async fn release_does_not_count_an_attempt() {
        let queue = RequestQueue::new(4, Some(1));
        let (req, rx) = request(&[1.0]);
        queue.release(req);
        queue.release(queue.recv().await.unwrap());

        let req = queue.recv().await.unwrap();
        assert_eq!(req.attempts, 0);
        queue.requeue(req);
        assert_eq!(
            rx.await.unwrap(),
            Err(Error::RetriesExhausted { attempts: 1 })
        );
    }

    #[tokio::test]
    async fn exhausted_requests_are_answered_with_an_error() {
        let queue = RequestQueue::new(4, Some(2));
        let (req, rx) = request(&[1.0]);
        queue.requeue(req);
        let req = queue.recv().await.unwrap();
        queue.requeue(req);

        assert!(queue.is_empty());
        assert_eq!(
            rx.await.unwrap(),
            Err(Error::RetriesExhausted { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_requests() {
        let queue = RequestQueue::new(4, None);
        let (pending, pending_rx) = request(&[1.0]);
        queue.submit(pending).await.unwrap();

        assert_eq!(queue.close(), 1);
        assert_eq!(pending_rx.await.unwrap(), Err(Error::QueueClosed));

        let (late, late_rx) = request(&[2.0]);
        assert_eq!(queue.submit(late).await, Err(Error::QueueClosed));
        assert_eq!(late_rx.await.unwrap(), Err(Error::QueueClosed));
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn replies_to_a_gone_caller_are_reported_undelivered() {
        let (req, rx) = request(&[1.0]);
        drop(rx);
        assert!(!req.respond(Ok(MathReply { answer: 1.0 })));
    }
}
