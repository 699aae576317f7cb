//! Client-facing dispatch entry points.
//!
//! ## Structure
//!
//! - [`handler`] - `LoadBalancerServices` implementation (`DispatchService`).

pub mod handler;
