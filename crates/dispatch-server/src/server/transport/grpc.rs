use super::{Connection, Connector};
use core::time::Duration;
use dispatch_core::{
    Error, Result,
    proto::{MathArgs, MathReply, PingArgs, worker_services_client::WorkerServicesClient},
    types::Operation,
};
use futures::future::BoxFuture;
use tonic::{
    Request,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// Dials backends over gRPC and talks to their `WorkerServices`.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    dial_timeout: Duration,
}

impl GrpcConnector {
    pub const fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

/// Connection to one backend. Cloning the inner client is cheap: all clones
/// multiplex over the same HTTP/2 channel.
#[derive(Clone, Debug)]
pub struct GrpcConnection {
    address: String,
    client: WorkerServicesClient<Channel>,
}

/// Accepts both `host:port` and full URIs.
pub fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

impl Connector for GrpcConnector {
    type Connection = GrpcConnection;

    fn dial(&self, address: &str) -> BoxFuture<'static, Result<GrpcConnection>> {
        let address = address.to_string();
        let dial_timeout = self.dial_timeout;

        Box::pin(async move {
            let dial_error = |reason: String| Error::Dial {
                address: address.clone(),
                reason,
            };

            let endpoint = Endpoint::from_shared(endpoint_uri(&address))
                .map_err(|e| dial_error(e.to_string()))?
                .connect_timeout(dial_timeout);

            let channel = endpoint
                .connect()
                .await
                .map_err(|e| dial_error(e.to_string()))?;

            tracing::debug!("Dialed backend {address}");

            let client = WorkerServicesClient::new(channel)
                .send_compressed(CompressionEncoding::Zstd)
                .accept_compressed(CompressionEncoding::Zstd);

            Ok(GrpcConnection { address, client })
        })
    }
}

impl Connection for GrpcConnection {
    fn call(&self, operation: Operation, args: MathArgs) -> BoxFuture<'static, Result<MathReply>> {
        let mut client = self.client.clone();
        let address = self.address.clone();

        Box::pin(async move {
            let request = Request::new(args);
            let response = match operation {
                Operation::Add => client.add(request).await,
                Operation::Multiply => client.multiply(request).await,
            };

            response
                .map(tonic::Response::into_inner)
                .map_err(|status| Error::Call {
                    address,
                    reason: format!("{}: {}", status.code(), status.message()),
                })
        })
    }

    fn ping(&self, from: &str) -> BoxFuture<'static, Result<()>> {
        let mut client = self.client.clone();
        let address = self.address.clone();
        let from = from.to_string();

        Box::pin(async move {
            client
                .ping(Request::new(PingArgs { from }))
                .await
                .map(|_| ())
                .map_err(|status| Error::Call {
                    address,
                    reason: format!("{}: {}", status.code(), status.message()),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_http_scheme() {
        assert_eq!(endpoint_uri("127.0.0.1:9000"), "http://127.0.0.1:9000");
        assert_eq!(endpoint_uri("http://backend:9000"), "http://backend:9000");
    }

    #[tokio::test]
    async fn dialing_nothing_is_a_dial_error() {
        // Port 1 on loopback is reserved and never listening in CI.
        let connector = GrpcConnector::new(Duration::from_millis(200));
        match connector.dial("127.0.0.1:1").await {
            Err(Error::Dial { address, .. }) => assert_eq!(address, "127.0.0.1:1"),
            other => panic!("expected dial error, got {other:?}"),
        }
    }
}
