//! Registration and heartbeat against the dispatcher's registration
//! endpoint.

use super::config::BackendConfig;
use crate::server::transport::grpc::endpoint_uri;
use anyhow::Context;
use core::time::Duration;
use dispatch_core::proto::{
    PingArgs, RegisterArgs, registration_service_client::RegistrationServiceClient,
};
use tokio::time::MissedTickBehavior;
use tonic::transport::{Channel, Endpoint};

pub struct Registrar {
    client: RegistrationServiceClient<Channel>,
    address: String,
    heartbeat_interval: Duration,
}

impl Registrar {
    /// Connects to the registration endpoint. `address` is what this backend
    /// will register as.
    pub async fn connect(config: &BackendConfig, address: String) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(endpoint_uri(&config.registration_addr))?
            .connect_timeout(config.dial_timeout)
            .connect()
            .await
            .with_context(|| format!("failed to reach dispatcher at {}", config.registration_addr))?;

        Ok(Self {
            client: RegistrationServiceClient::new(channel),
            address,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    pub async fn register(&self) -> anyhow::Result<()> {
        self.client
            .clone()
            .register(RegisterArgs {
                address: self.address.clone(),
            })
            .await
            .context("registration rejected")?;
        tracing::info!("Registered {} with dispatcher", self.address);
        Ok(())
    }

    /// Pings the dispatcher every heartbeat interval. Returns an error on the
    /// first failed ping; never returns otherwise.
    pub async fn heartbeat(&self) -> anyhow::Result<()> {
        let mut client = self.client.clone();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            client
                .ping(PingArgs {
                    from: self.address.clone(),
                })
                .await
                .context("dispatcher stopped answering pings")?;
            tracing::trace!("Heartbeat acknowledged");
        }
    }
}
