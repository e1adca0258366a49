//! Server configuration.

use clap::Parser;
use std::time::Duration;

/// Default API service port.
pub const DEFAULT_PORT: u16 = 10800;

/// Default per-request budget for the backend changed-block fetch.
pub const DEFAULT_ENRICH_TIMEOUT_SECS: u64 = 180;

/// Default interval between driver registration attempts.
pub const DEFAULT_REGISTER_RETRY_SECS: u64 = 5;

/// Default overall deadline for driver registration.
pub const DEFAULT_REGISTER_DEADLINE_SECS: u64 = 300;

/// Command-line arguments for the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "snapdelta")]
#[command(about = "Changed-block delta tracking service for volume snapshots")]
#[command(version)]
pub struct Args {
    /// Host address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the API service.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Timeout in seconds for backend changed-block fetches.
    #[arg(long, default_value_t = DEFAULT_ENRICH_TIMEOUT_SECS)]
    pub enrich_timeout: u64,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (minimal logging).
    #[arg(long, short = 's')]
    pub silent: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            enrich_timeout: DEFAULT_ENRICH_TIMEOUT_SECS,
            debug: false,
            silent: false,
        }
    }
}

/// Server configuration derived from command-line arguments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host address to bind to.
    pub host: String,
    /// Port for the API service.
    pub port: u16,
    /// Per-request budget for backend changed-block fetches.
    pub enrich_timeout: Duration,
    /// Interval between driver registration attempts.
    pub register_retry_interval: Duration,
    /// Overall deadline for driver registration.
    pub register_deadline: Duration,
    /// Enable debug logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            enrich_timeout: Duration::from_secs(DEFAULT_ENRICH_TIMEOUT_SECS),
            register_retry_interval: Duration::from_secs(DEFAULT_REGISTER_RETRY_SECS),
            register_deadline: Duration::from_secs(DEFAULT_REGISTER_DEADLINE_SECS),
            debug: false,
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            enrich_timeout: Duration::from_secs(args.enrich_timeout),
            debug: args.debug,
            ..Config::default()
        }
    }
}

impl Config {
    /// Returns the bind address for the API service.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
