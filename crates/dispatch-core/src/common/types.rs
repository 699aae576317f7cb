//! # Shared Dispatch Types and Constants
//!
//! Types shared by the dispatcher, its backends and clients so every process
//! agrees on what an operation is and where the dispatcher listens by default.
//!
//! ## Operations
//!
//! [`Operation`] is the method tag carried by every queued request. The
//! dispatcher never inspects the payload; it only uses the tag to pick the
//! backend RPC to invoke. Backends use [`Operation::apply`] to do the work.
//!
//! ## Constants
//!
//! - [`DEFAULT_DISPATCH_ADDR`] - client-facing endpoint
//! - [`DEFAULT_REGISTRATION_ADDR`] - registration endpoint
//! - [`DEFAULT_QUEUE_CAPACITY`] - backpressure limit of the shared queue
//! - [`DEFAULT_REQUEST_TIMEOUT`] - per-request deadline enforced by handles

use core::fmt;
use core::time::Duration;

/// Client-facing endpoint of the dispatcher.
pub const DEFAULT_DISPATCH_ADDR: &str = "127.0.0.1:55101";

/// Endpoint backends register with.
pub const DEFAULT_REGISTRATION_ADDR: &str = "127.0.0.1:55103";

/// Number of requests the shared queue holds before submitters block.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Deadline for a single attempt of a request on one backend.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A backend operation a request can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Multiply,
}

impl Operation {
    /// Name of the RPC method on `WorkerServices`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "Add",
            Operation::Multiply => "Multiply",
        }
    }

    /// Fully qualified `Service.Method` name of the backend RPC.
    pub const fn backend_method(&self) -> &'static str {
        match self {
            Operation::Add => "WorkerServices.Add",
            Operation::Multiply => "WorkerServices.Multiply",
        }
    }

    /// Folds `numbers` with this operation.
    ///
    /// An empty input yields the identity: `0` for [`Operation::Add`] and `1`
    /// for [`Operation::Multiply`].
    pub fn apply(&self, numbers: &[f64]) -> f64 {
        match self {
            Operation::Add => numbers.iter().sum(),
            Operation::Multiply => numbers.iter().product(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sums_numbers() {
        assert_eq!(Operation::Add.apply(&[10.0, 1.0]), 11.0);
        assert_eq!(Operation::Add.apply(&[]), 0.0);
    }

    #[test]
    fn multiply_takes_product() {
        assert_eq!(Operation::Multiply.apply(&[10.0, 1.0]), 10.0);
        assert_eq!(Operation::Multiply.apply(&[]), 1.0);
        assert_eq!(Operation::Multiply.apply(&[2.0, 3.0, 4.0]), 24.0);
    }
}
