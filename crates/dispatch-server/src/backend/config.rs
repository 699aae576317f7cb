use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use dispatch_core::types::DEFAULT_REGISTRATION_ADDR;

/// Runtime configuration for the `dispatch-backend` binary.
///
/// A backend listens on `BACKEND_ADDR` (an ephemeral port by default),
/// registers the address it actually bound with the dispatcher at
/// `REGISTRATION_ADDR`, and pings the dispatcher every heartbeat interval,
/// exiting once a ping fails.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dispatch-backend",
    version,
    about = "A worker backend that registers with the dispatcher"
)]
pub struct BackendArgs {
    /// Address of the dispatcher's registration endpoint.
    ///
    /// Environment variable: `REGISTRATION_ADDR`
    #[arg(long, env = "REGISTRATION_ADDR", default_value_t = String::from(DEFAULT_REGISTRATION_ADDR))]
    pub registration_addr: String,

    /// Address to serve `WorkerServices` on. Port 0 picks a free port.
    ///
    /// Environment variable: `BACKEND_ADDR`
    #[arg(long, env = "BACKEND_ADDR", default_value = "127.0.0.1:0")]
    pub backend_addr: String,

    /// Interval between pings to the dispatcher, in milliseconds.
    ///
    /// Environment variable: `HEARTBEAT_INTERVAL_MS`
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 5_000)]
    pub heartbeat_interval_ms: u64,

    /// Connect timeout for the registration endpoint, in milliseconds.
    ///
    /// Environment variable: `DIAL_TIMEOUT_MS`
    #[arg(long, env = "DIAL_TIMEOUT_MS", default_value_t = 2_000)]
    pub dial_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub registration_addr: String,
    pub backend_addr: String,
    pub heartbeat_interval: Duration,
    pub dial_timeout: Duration,
}

impl TryFrom<BackendArgs> for BackendConfig {
    type Error = anyhow::Error;

    fn try_from(args: BackendArgs) -> Result<Self, Self::Error> {
        if args.heartbeat_interval_ms == 0 {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than 0");
        }
        if args.dial_timeout_ms == 0 {
            bail!("DIAL_TIMEOUT_MS must be greater than 0");
        }

        Ok(Self {
            registration_addr: args.registration_addr,
            backend_addr: args.backend_addr,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            dial_timeout: Duration::from_millis(args.dial_timeout_ms),
        })
    }
}
