//! Backend connection pool.
//!
//! ## Structure
//!
//! - [`manager`] - `WorkerPool`, one entry per registered address.
//! - [`worker`] - `WorkerHandle`, the per-backend dial/service/health loop.
//! - [`backoff`] - delay schedule for redialing unreachable backends.

pub mod backoff;
pub mod manager;
pub mod worker;
