//! Worker handle: the dispatcher-side owner of one backend connection.
//!
//! A handle dials its backend once, then loops over three competing events:
//! its stop token, a periodic health-check tick, and the next request on the
//! shared queue. Whichever is ready first wins.
//!
//! While servicing, the backend call is raced against the request's own
//! timeout and the stop token:
//!
//! - the call answers: the reply goes back to the caller and the handle is
//!   idle again;
//! - the call fails or times out: the request is requeued for another handle,
//!   and the backend is probed straight away so a dead backend is retired
//!   instead of pulling more work;
//! - the stop token fires: the handle stops.
//!
//! Whatever the exit path, a request the handle still holds is requeued
//! before the connection is released. A timed-out call is not cancelled on
//! the backend side, so an operation may run more than once.

use crate::server::{
    queue::{RequestQueue, ServiceRequest},
    telemetry::{
        decrement_handles_active, increment_handles_active, increment_retirements,
        increment_serviced,
    },
    transport::{Connection, Connector},
};
use core::{fmt, time::Duration};
use dispatch_core::{Error, Result, proto::MathReply};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at, sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Name a handle identifies itself with when pinging a backend.
const PING_FROM: &str = "dispatcher";

/// Health-check timing shared by every handle in a pool.
#[derive(Clone, Copy, Debug)]
pub struct HandleConfig {
    pub health_check_freq: Duration,
    pub health_check_timeout: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            health_check_freq: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of a handle, published for observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Dialing,
    Idle,
    Servicing,
    Stopping,
    Stopped,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dialing => "dialing",
            Self::Idle => "idle",
            Self::Servicing => "servicing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a handle stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetireReason {
    /// The backend could not be reached at startup.
    DialFailed(Error),
    /// A ping failed or timed out.
    HealthCheckFailed(Error),
    /// The stop token fired.
    Stopped,
    /// The shared queue was closed and drained.
    QueueClosed,
    /// The handle's task panicked or was aborted.
    Aborted(String),
}

impl RetireReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DialFailed(_) => "dial_failed",
            Self::HealthCheckFailed(_) => "health_check_failed",
            Self::Stopped => "stopped",
            Self::QueueClosed => "queue_closed",
            Self::Aborted(_) => "aborted",
        }
    }

    pub const fn is_dial_failure(&self) -> bool {
        matches!(self, Self::DialFailed(_))
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialFailed(err) | Self::HealthCheckFailed(err) => {
                write!(f, "{}: {err}", self.as_str())
            }
            Self::Aborted(reason) => write!(f, "{}: {reason}", self.as_str()),
            Self::Stopped | Self::QueueClosed => f.write_str(self.as_str()),
        }
    }
}

/// Outcome of a handle's run, handed back to the pool.
#[derive(Clone, Debug)]
pub struct Retirement {
    pub address: String,
    pub generation: usize,
    pub reason: RetireReason,
    /// Requests this handle answered successfully.
    pub serviced: u64,
}

enum CallOutcome {
    Replied(MathReply),
    Failed(Error),
    Stopped,
}

/// Owns the connection to one backend and services requests from the shared
/// queue until it is stopped or the backend stops answering.
///
/// All mutable state belongs to the task running [`WorkerHandle::run`].
pub struct WorkerHandle<C: Connector> {
    address: String,
    generation: usize,
    connector: Arc<C>,
    connection: Option<C::Connection>,
    task: Option<ServiceRequest>,
    queue: RequestQueue,
    stop: CancellationToken,
    config: HandleConfig,
    state: watch::Sender<HandleState>,
    serviced: u64,
}

impl<C: Connector> WorkerHandle<C> {
    pub fn new(
        address: impl Into<String>,
        generation: usize,
        connector: Arc<C>,
        queue: RequestQueue,
        config: HandleConfig,
        stop: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(HandleState::Dialing);
        Self {
            address: address.into(),
            generation,
            connector,
            connection: None,
            task: None,
            queue,
            stop,
            config,
            state,
            serviced: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HandleState> {
        self.state.subscribe()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Runs the handle to completion.
    pub async fn run(mut self) -> Retirement {
        increment_handles_active();

        let reason = self.run_loop().await;
        self.retire(&reason);

        decrement_handles_active();
        increment_retirements(reason.as_str());

        match &reason {
            RetireReason::Stopped | RetireReason::QueueClosed => {
                tracing::info!("Handle for {} stopped ({reason})", self.address);
            }
            _ => tracing::warn!("Handle for {} retired ({reason})", self.address),
        }

        Retirement {
            address: self.address,
            generation: self.generation,
            reason,
            serviced: self.serviced,
        }
    }

    async fn run_loop(&mut self) -> RetireReason {
        self.set_state(HandleState::Dialing);
        let dialed = tokio::select! {
            () = self.stop.cancelled() => return RetireReason::Stopped,
            dialed = self.connector.dial(&self.address) => dialed,
        };
        match dialed {
            Ok(connection) => self.connection = Some(connection),
            Err(err) => return RetireReason::DialFailed(err),
        }

        tracing::info!("Connected to backend {}", self.address);
        self.set_state(HandleState::Idle);

        let freq = self.config.health_check_freq;
        let mut health = interval_at(Instant::now() + freq, freq);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.cancelled() => return RetireReason::Stopped,
                _ = health.tick() => {
                    if let Err(err) = self.health_check().await {
                        return RetireReason::HealthCheckFailed(err);
                    }
                }
                request = self.queue.recv() => {
                    let Some(request) = request else {
                        return RetireReason::QueueClosed;
                    };
                    if let Some(reason) = self.service_request(request).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Services one request. Returns a reason when the handle must stop.
    async fn service_request(&mut self, request: ServiceRequest) -> Option<RetireReason> {
        let Some(connection) = self.connection.as_ref() else {
            self.queue.requeue(request);
            return Some(RetireReason::Aborted("serviced without a connection".into()));
        };

        self.set_state(HandleState::Servicing);
        let id = request.id;
        let operation = request.operation;
        let deadline = request.timeout;
        let call = connection.call(operation, request.args.clone());
        self.task = Some(request);

        tracing::debug!("Calling {} on {} for request {id}", operation.backend_method(), self.address);

        let outcome = tokio::select! {
            () = self.stop.cancelled() => CallOutcome::Stopped,
            result = call => match result {
                Ok(reply) => CallOutcome::Replied(reply),
                Err(err) => CallOutcome::Failed(err),
            },
            () = sleep(deadline) => CallOutcome::Failed(Error::Timeout {
                context: format!("request {id} on {} after {deadline:?}", self.address),
            }),
        };

        match outcome {
            CallOutcome::Replied(reply) => {
                self.serviced += 1;
                increment_serviced();
                tracing::info!("{} serviced {operation} request {id}", self.address);

                if let Some(request) = self.task.take() {
                    if !request.respond(Ok(reply)) {
                        tracing::warn!("Caller of request {id} is gone, reply dropped");
                    }
                }
            }
            CallOutcome::Failed(err) => {
                tracing::warn!("Request {id} failed on {}: {err}", self.address);
                if let Some(request) = self.task.take() {
                    self.queue.requeue(request);
                }

                // The failure may mean the backend is gone.
                if let Err(err) = self.health_check().await {
                    return Some(RetireReason::HealthCheckFailed(err));
                }
            }
            CallOutcome::Stopped => return Some(RetireReason::Stopped),
        }

        self.set_state(HandleState::Idle);
        None
    }

    async fn health_check(&self) -> Result<()> {
        let Some(connection) = self.connection.as_ref() else {
            return Err(Error::HealthCheck {
                address: self.address.clone(),
                reason: "not connected".into(),
            });
        };

        match timeout(self.config.health_check_timeout, connection.ping(PING_FROM)).await {
            Ok(Ok(())) => {
                tracing::trace!("Health check passed for {}", self.address);
                Ok(())
            }
            Ok(Err(err)) => Err(Error::HealthCheck {
                address: self.address.clone(),
                reason: err.to_string(),
            }),
            Err(_) => Err(Error::HealthCheck {
                address: self.address.clone(),
                reason: format!("no reply within {:?}", self.config.health_check_timeout),
            }),
        }
    }

    fn retire(&mut self, reason: &RetireReason) {
        self.set_state(HandleState::Stopping);

        if let Some(request) = self.task.take() {
            tracing::info!(
                "Handle for {} requeueing held request {} ({})",
                self.address,
                request.id,
                reason.as_str()
            );
            match reason {
                RetireReason::Stopped => self.queue.release(request),
                _ => self.queue.requeue(request),
            }
        }

        self.connection = None;
        self.set_state(HandleState::Stopped);
    }

    fn set_state(&self, state: HandleState) {
        self.state.send_replace(state);
    }
}

impl<C: Connector> fmt::Debug for WorkerHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("state", &*self.state.borrow())
            .field("task", &self.task)
            .field("serviced", &self.serviced)
            .finish()
    }
}
