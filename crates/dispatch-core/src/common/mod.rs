pub mod error;
pub mod types;

pub use error::*;

/// gRPC service and message definitions generated from `proto/dispatch.proto`.
///
/// ## Services
///
/// - `LoadBalancerServices` - client-facing `Add` / `Multiply`, answered by
///   whichever registered backend picks the request off the shared queue.
/// - `RegistrationService` - `Register` and `Ping`, called by backends.
/// - `WorkerServices` - `Ping`, `Add` and `Multiply`, served by every backend
///   and invoked by the dispatcher's worker handles.
///
/// [`FILE_DESCRIPTOR_SET`](proto::FILE_DESCRIPTOR_SET) is the encoded schema,
/// registered with the reflection service so tools like `grpcurl` work without
/// a local copy of the proto file.
pub mod proto {
    tonic::include_proto!("dispatch");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("dispatch_descriptor");
}
