//! Dispatcher-side view of a backend connection.
//!
//! A worker handle only needs three capabilities from the wire: dial an
//! address, issue a call, and probe liveness. They are expressed as the
//! [`Connector`] and [`Connection`] traits so the handle's state machine is
//! independent of how bytes reach the backend.
//!
//! Calls return owned `'static` futures. A handle races the in-flight call
//! against its timeout and stop signal and simply drops the call future when
//! it loses. Dropping stops waiting for the reply; it does not stop the
//! backend from executing the call.
//!
//! ## Implementations
//!
//! - [`grpc::GrpcConnector`] - `WorkerServices` over tonic/HTTP2.
//! - [`local::LocalConnector`] - backends living in the same process.

pub mod grpc;
pub mod local;

use dispatch_core::{
    Result,
    proto::{MathArgs, MathReply},
    types::Operation,
};
use futures::future::BoxFuture;

/// An established connection to one backend.
pub trait Connection: Send + Sync + 'static {
    /// Invokes `operation` on the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Call`](dispatch_core::Error::Call) if the backend
    /// answers with an error or the connection drops mid-call.
    fn call(&self, operation: Operation, args: MathArgs) -> BoxFuture<'static, Result<MathReply>>;

    /// Sends a liveness probe. `from` identifies the prober in backend logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached. The caller enforces
    /// its own deadline.
    fn ping(&self, from: &str) -> BoxFuture<'static, Result<()>>;
}

/// Establishes connections to backends by address.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Connects to the backend listening on `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dial`](dispatch_core::Error::Dial) if the backend
    /// cannot be reached.
    fn dial(&self, address: &str) -> BoxFuture<'static, Result<Self::Connection>>;
}
