// GraphQL Jobs - Job Worker
// Run with: cargo run --bin jobserver -- --port 5001

//! # Job Worker Binary
//!
//! Binds a TCP socket, writes `jobserver-<pid>` into the runtime directory so
//! the GraphQL server can find it, and runs commands from its fixed table until
//! Ctrl-C or SIGTERM. The descriptor file is removed on the way out.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use graphql_jobs::{runtime_dir, JobServer, JobServerConfig, APP_NAME};

#[derive(Parser)]
#[command(name = "graphql-jobs-jobserver")]
#[command(about = "Job worker that runs commands for the GraphQL Jobs server")]
#[command(version)]
struct Cli {
    /// IP address to bind
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port to bind; 0 picks a free port
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Seconds to wait before running each job
    #[arg(long, default_value_t = 0.0)]
    sleep: f64,

    /// Directory for the worker descriptor
    #[arg(long, env = "JOBS_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Log filter
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Set log level to debug
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    if !cli.sleep.is_finite() || cli.sleep < 0.0 {
        anyhow::bail!("--sleep must be a non-negative number of seconds");
    }

    let config = JobServerConfig {
        ip: cli.ip,
        port: cli.port,
        runtime_dir: cli.runtime_dir.unwrap_or_else(|| runtime_dir(APP_NAME)),
        delay: Duration::from_secs_f64(cli.sleep),
    };

    JobServer::new(config).run().await?;
    Ok(())
}
