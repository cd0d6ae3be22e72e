use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use std::net::SocketAddr;

/// Runtime configuration for the `decrypter-server` binary.
///
/// These settings control how much CPU the service may spend on bcrypt at
/// once and how long callers are allowed to wait for it. All values are parsed
/// from CLI arguments or environment variables (a `.env` file is honoured).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "decrypter-server",
    version,
    about = "An HTTP service that verifies passwords against bcrypt hashes"
)]
pub struct CliArgs {
    /// Number of verification workers, i.e. the maximum number of bcrypt
    /// comparisons running in parallel.
    ///
    /// Defaults to the number of logical CPUs. Requests beyond this limit wait
    /// in the intake queue rather than competing for cores.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(
        long,
        visible_alias = "num-decrypt-pool-workers",
        env = "NUM_WORKERS",
        default_value_t = num_cpus::get()
    )]
    pub num_workers: usize,

    /// Capacity of the intake queue in front of the workers.
    ///
    /// Once full, request handlers wait for a free slot before enqueueing.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = decrypter::DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Maximum time in milliseconds a request may wait for a verdict before
    /// failing with 503. `0` waits indefinitely.
    ///
    /// Environment variable: `SUBMIT_TIMEOUT_MS`
    #[arg(long, env = "SUBMIT_TIMEOUT_MS", default_value_t = 0)]
    pub submit_timeout_ms: u64,

    /// Seconds to wait for in-flight verifications during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub submit_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub server_addr: SocketAddr,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }

        let server_addr = args
            .server_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid SERVER_ADDR `{}`", args.server_addr))?;

        let submit_timeout =
            (args.submit_timeout_ms > 0).then(|| Duration::from_millis(args.submit_timeout_ms));

        Ok(Self {
            num_workers: args.num_workers,
            queue_capacity: args.queue_capacity,
            submit_timeout,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr,
        })
    }
}
