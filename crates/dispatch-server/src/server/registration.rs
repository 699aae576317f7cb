//! Registration directory and the gRPC service backends register through.
//!
//! The directory is append-only: every `Register` call adds an entry, even
//! for an address that is already known. The pool deduplicates by address
//! when it reconciles, and uses the position of the most recent entry for an
//! address (its *generation*) to tell a re-registration apart from a stale
//! one.

use dispatch_core::{
    Error,
    proto::{
        PingArgs, PingReply, RegisterArgs, RegisterReply,
        registration_service_server::RegistrationService,
    },
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tonic::{Request, Response, Status};

/// One distinct backend address as seen by pool reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registered {
    pub address: String,
    /// Index of the most recent registration of `address`.
    pub generation: usize,
}

/// Append-only list of backend addresses, shared between the registration
/// service and the coordinator.
#[derive(Debug, Default)]
pub struct Registration {
    addresses: Mutex<Vec<String>>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>) {
        self.addresses.lock().push(address.into());
    }

    /// Every registration so far, duplicates included.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.lock().is_empty()
    }

    /// Distinct addresses in first-registration order, each tagged with the
    /// generation of its latest registration.
    pub fn snapshot(&self) -> Vec<Registered> {
        let addresses = self.addresses();

        let mut latest: HashMap<&str, usize> = HashMap::with_capacity(addresses.len());
        let mut order = Vec::new();
        for (generation, address) in addresses.iter().enumerate() {
            if latest.insert(address.as_str(), generation).is_none() {
                order.push(address.as_str());
            }
        }

        order
            .into_iter()
            .map(|address| Registered {
                address: address.to_string(),
                generation: latest[address],
            })
            .collect()
    }

    pub fn report(&self) -> String {
        format!("Registration: {:?}", self.addresses.lock())
    }
}

/// gRPC front of the [`Registration`] directory.
#[derive(Clone, Debug)]
pub struct RegistrationHandler {
    registration: Arc<Registration>,
}

impl RegistrationHandler {
    pub const fn new(registration: Arc<Registration>) -> Self {
        Self { registration }
    }
}

#[tonic::async_trait]
impl RegistrationService for RegistrationHandler {
    async fn register(
        &self,
        request: Request<RegisterArgs>,
    ) -> Result<Response<RegisterReply>, Status> {
        let address = request.into_inner().address;
        if address.trim().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "address must not be empty".to_string(),
            }
            .into());
        }

        tracing::info!("Registering backend {address}");
        self.registration.register(address);
        Ok(Response::new(RegisterReply {}))
    }

    async fn ping(&self, request: Request<PingArgs>) -> Result<Response<PingReply>, Status> {
        let from = request.into_inner().from;
        tracing::trace!("Ping from {from}");
        Ok(Response::new(PingReply { from }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_dedups_and_tracks_latest_generation() {
        let registration = Registration::new();
        registration.register("a:1");
        registration.register("b:2");
        registration.register("a:1");

        assert_eq!(registration.len(), 3);
        assert_eq!(
            registration.snapshot(),
            vec![
                Registered {
                    address: "a:1".into(),
                    generation: 2,
                },
                Registered {
                    address: "b:2".into(),
                    generation: 1,
                },
            ]
        );
    }

    #[test]
    fn report_lists_every_registration() {
        let registration = Registration::new();
        assert!(registration.is_empty());
        registration.register("a:1");
        registration.register("a:1");
        assert_eq!(registration.report(), r#"Registration: ["a:1", "a:1"]"#);
    }

    #[tokio::test]
    async fn register_appends_and_rejects_empty_addresses() {
        let registration = Arc::new(Registration::new());
        let handler = RegistrationHandler::new(registration.clone());

        handler
            .register(Request::new(RegisterArgs {
                address: "127.0.0.1:4000".into(),
            }))
            .await
            .unwrap();
        let err = handler
            .register(Request::new(RegisterArgs {
                address: "  ".into(),
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(err.message(), "address must not be empty");
        assert_eq!(registration.addresses(), vec!["127.0.0.1:4000".to_string()]);
    }

    #[tokio::test]
    async fn ping_echoes_sender() {
        let handler = RegistrationHandler::new(Arc::new(Registration::new()));
        let reply = handler
            .ping(Request::new(PingArgs {
                from: "backend".into(),
            }))
            .await
            .unwrap();
        assert_eq!(reply.into_inner().from, "backend");
    }
}
