use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use dispatch_core::types::{
    DEFAULT_DISPATCH_ADDR, DEFAULT_QUEUE_CAPACITY, DEFAULT_REGISTRATION_ADDR,
    DEFAULT_REQUEST_TIMEOUT,
};

/// Runtime configuration for the `dispatch-server` binary.
///
/// These settings control the two listening endpoints, the shared request
/// queue, and how worker handles probe and retire backends. All values are
/// parsed from CLI arguments or environment variables (a `.env` file is
/// loaded first), with defaults suitable for a single-host deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "dispatch-server",
    version,
    about = "A gRPC dispatcher that fans requests out to registered backends"
)]
pub struct CliArgs {
    /// Client-facing address serving `LoadBalancerServices`.
    ///
    /// Environment variable: `DISPATCH_ADDR`
    #[arg(long, env = "DISPATCH_ADDR", default_value_t = String::from(DEFAULT_DISPATCH_ADDR))]
    pub dispatch_addr: String,

    /// Address serving `RegistrationService`; backends register here.
    ///
    /// Environment variable: `REGISTRATION_ADDR`
    #[arg(long, env = "REGISTRATION_ADDR", default_value_t = String::from(DEFAULT_REGISTRATION_ADDR))]
    pub registration_addr: String,

    /// Number of requests the shared queue holds before clients block.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Deadline for one attempt of a request on one backend, in milliseconds.
    /// A request that misses it is requeued for another backend.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT.as_millis() as u64)]
    pub request_timeout_ms: u64,

    /// How often an idle handle pings its backend, in milliseconds.
    ///
    /// Environment variable: `HEALTH_CHECK_FREQ_MS`
    #[arg(long, env = "HEALTH_CHECK_FREQ_MS", default_value_t = 5_000)]
    pub health_check_freq_ms: u64,

    /// How long a ping may take before the backend is considered dead, in
    /// milliseconds. Must be shorter than the health-check frequency.
    ///
    /// Environment variable: `HEALTH_CHECK_TIMEOUT_MS`
    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_MS", default_value_t = 2_000)]
    pub health_check_timeout_ms: u64,

    /// Interval between reconciliations of the pool against the
    /// registration directory, in milliseconds.
    ///
    /// Environment variable: `COORDINATOR_INTERVAL_MS`
    #[arg(long, env = "COORDINATOR_INTERVAL_MS", default_value_t = 5_000)]
    pub coordinator_interval_ms: u64,

    /// Connect timeout when dialing a backend, in milliseconds.
    ///
    /// Environment variable: `DIAL_TIMEOUT_MS`
    #[arg(long, env = "DIAL_TIMEOUT_MS", default_value_t = 2_000)]
    pub dial_timeout_ms: u64,

    /// Delay before the first redial of a backend that could not be reached,
    /// in milliseconds. Doubles on each consecutive failure.
    ///
    /// Environment variable: `DIAL_BACKOFF_FIRST_MS`
    #[arg(long, env = "DIAL_BACKOFF_FIRST_MS", default_value_t = 500)]
    pub dial_backoff_first_ms: u64,

    /// Upper bound on the redial delay, in milliseconds.
    ///
    /// Environment variable: `DIAL_BACKOFF_MAX_MS`
    #[arg(long, env = "DIAL_BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub dial_backoff_max_ms: u64,

    /// Consecutive dial failures after which a backend is given up on until
    /// it registers again.
    ///
    /// Environment variable: `MAX_DIAL_ATTEMPTS`
    #[arg(long, env = "MAX_DIAL_ATTEMPTS", default_value_t = 5)]
    pub max_dial_attempts: u32,

    /// Maximum attempts per request before the caller receives an error.
    /// Unset means requests are retried until some backend answers.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Seconds to wait for worker handles to stop during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dispatch_addr: String,
    pub registration_addr: String,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub health_check_freq: Duration,
    pub health_check_timeout: Duration,
    pub coordinator_interval: Duration,
    pub dial_timeout: Duration,
    pub dial_backoff_first: Duration,
    pub dial_backoff_max: Duration,
    pub max_dial_attempts: u32,
    pub max_attempts: Option<u32>,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dispatch_addr: DEFAULT_DISPATCH_ADDR.to_string(),
            registration_addr: DEFAULT_REGISTRATION_ADDR.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_check_freq: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
            coordinator_interval: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(2),
            dial_backoff_first: Duration::from_millis(500),
            dial_backoff_max: Duration::from_secs(30),
            max_dial_attempts: 5,
            max_attempts: None,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        for (name, value) in [
            ("REQUEST_TIMEOUT_MS", args.request_timeout_ms),
            ("HEALTH_CHECK_FREQ_MS", args.health_check_freq_ms),
            ("HEALTH_CHECK_TIMEOUT_MS", args.health_check_timeout_ms),
            ("COORDINATOR_INTERVAL_MS", args.coordinator_interval_ms),
            ("DIAL_TIMEOUT_MS", args.dial_timeout_ms),
            ("DIAL_BACKOFF_FIRST_MS", args.dial_backoff_first_ms),
            ("SHUTDOWN_TIMEOUT_SECS", args.shutdown_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        if args.health_check_timeout_ms >= args.health_check_freq_ms {
            bail!(
                "HEALTH_CHECK_TIMEOUT_MS ({}) must be shorter than HEALTH_CHECK_FREQ_MS ({})",
                args.health_check_timeout_ms,
                args.health_check_freq_ms
            );
        }

        if args.dial_backoff_max_ms < args.dial_backoff_first_ms {
            bail!(
                "DIAL_BACKOFF_MAX_MS ({}) must not be below DIAL_BACKOFF_FIRST_MS ({})",
                args.dial_backoff_max_ms,
                args.dial_backoff_first_ms
            );
        }

        if args.max_attempts == Some(0) {
            bail!("MAX_ATTEMPTS must be greater than 0 when set");
        }

        if args.dispatch_addr == args.registration_addr {
            bail!(
                "DISPATCH_ADDR and REGISTRATION_ADDR must differ (both are {})",
                args.dispatch_addr
            );
        }

        Ok(Self {
            dispatch_addr: args.dispatch_addr,
            registration_addr: args.registration_addr,
            queue_capacity: args.queue_capacity,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            health_check_freq: Duration::from_millis(args.health_check_freq_ms),
            health_check_timeout: Duration::from_millis(args.health_check_timeout_ms),
            coordinator_interval: Duration::from_millis(args.coordinator_interval_ms),
            dial_timeout: Duration::from_millis(args.dial_timeout_ms),
            dial_backoff_first: Duration::from_millis(args.dial_backoff_first_ms),
            dial_backoff_max: Duration::from_millis(args.dial_backoff_max_ms),
            max_dial_attempts: args.max_dial_attempts,
            max_attempts: args.max_attempts,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("dispatch-server").chain(extra.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.coordinator_interval, Duration::from_secs(5));
        assert_eq!(config.max_attempts, None);
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(parse(&["--queue-capacity", "0"]).is_err());
    }

    #[test]
    fn rejects_zero_shutdown_timeout() {
        let err = parse(&["--shutdown-timeout-secs", "0"]).unwrap_err();
        assert!(err.to_string().contains("SHUTDOWN_TIMEOUT_SECS"));
    }

    #[test]
    fn rejects_health_timeout_not_shorter_than_frequency() {
        let err = parse(&[
            "--health-check-freq-ms",
            "1000",
            "--health-check-timeout-ms",
            "1000",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("HEALTH_CHECK_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_shared_address() {
        assert!(
            parse(&[
                "--dispatch-addr",
                "127.0.0.1:7000",
                "--registration-addr",
                "127.0.0.1:7000",
            ])
            .is_err()
        );
    }

    #[test]
    fn max_attempts_must_be_positive() {
        assert!(parse(&["--max-attempts", "0"]).is_err());
        assert_eq!(parse(&["--max-attempts", "3"]).unwrap().max_attempts, Some(3));
    }
}
