use super::{Connection, Connector};
use crate::backend::service::WorkerService;
use dispatch_core::{
    Error, Result,
    proto::{MathArgs, MathReply, PingArgs, worker_services_server::WorkerServices},
    types::Operation,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tonic::Request;

type Backends = Arc<RwLock<HashMap<String, WorkerService>>>;

/// Connects to backends hosted inside the dispatcher's own process.
///
/// Backends are looked up by address on every call, so removing one behaves
/// like the backend process going away: open connections start failing and
/// new dials are refused.
#[derive(Clone, Debug, Default)]
pub struct LocalConnector {
    backends: Backends,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts `service` under `address`, replacing any previous backend there.
    pub fn insert(&self, address: impl Into<String>, service: WorkerService) {
        self.backends.write().insert(address.into(), service);
    }

    /// Takes the backend at `address` offline.
    pub fn remove(&self, address: &str) -> Option<WorkerService> {
        self.backends.write().remove(address)
    }

    fn lookup(backends: &Backends, address: &str) -> Option<WorkerService> {
        backends.read().get(address).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct LocalConnection {
    address: String,
    backends: Backends,
}

impl LocalConnection {
    fn unreachable(&self) -> Error {
        Error::Call {
            address: self.address.clone(),
            reason: "backend is no longer hosted".to_string(),
        }
    }
}

impl Connector for LocalConnector {
    type Connection = LocalConnection;

    fn dial(&self, address: &str) -> BoxFuture<'static, Result<LocalConnection>> {
        let result = match Self::lookup(&self.backends, address) {
            Some(_) => Ok(LocalConnection {
                address: address.to_string(),
                backends: Arc::clone(&self.backends),
            }),
            None => Err(Error::Dial {
                address: address.to_string(),
                reason: "no backend hosted at this address".to_string(),
            }),
        };
        Box::pin(async move { result })
    }
}

impl Connection for LocalConnection {
    fn call(&self, operation: Operation, args: MathArgs) -> BoxFuture<'static, Result<MathReply>> {
        let service = LocalConnector::lookup(&self.backends, &self.address);
        let unreachable = self.unreachable();
        let address = self.address.clone();

        Box::pin(async move {
            let service = service.ok_or(unreachable)?;
            let request = Request::new(args);
            let response = match operation {
                Operation::Add => service.add(request).await,
                Operation::Multiply => service.multiply(request).await,
            };
            response
                .map(tonic::Response::into_inner)
                .map_err(|status| Error::Call {
                    address,
                    reason: status.message().to_string(),
                })
        })
    }

    fn ping(&self, from: &str) -> BoxFuture<'static, Result<()>> {
        let service = LocalConnector::lookup(&self.backends, &self.address);
        let unreachable = self.unreachable();
        let address = self.address.clone();
        let from = from.to_string();

        Box::pin(async move {
            let service = service.ok_or(unreachable)?;
            service
                .ping(Request::new(PingArgs { from }))
                .await
                .map(|_| ())
                .map_err(|status| Error::Call {
                    address,
                    reason: status.message().to_string(),
                })
        })
    }
}
