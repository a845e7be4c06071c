// GraphQL Jobs - Main GraphQL Server
// Run with: cargo run --bin server

//! # GraphQL Jobs Server Binary
//!
//! Starts the HTTP server: GraphQL at `/graphql`, subscriptions over
//! WebSocket, `POST /command` for the job workers and GraphiQL at `/graphiql`.
//!
//! Job workers are discovered once at startup from the runtime directory
//! (start them first with `cargo run --bin jobserverapp`). Pass `--rescan` to
//! re-read the directory before every dispatch instead.
//!
//! Every option can also come from the environment or a `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use graphql_jobs::{
    runtime_dir, CorsConfig, DispatcherConfig, GraphQLServerBuilder, ServerConfig, APP_NAME,
};

#[derive(Parser)]
#[command(name = "graphql-jobs-server")]
#[command(about = "An example GraphQL API server with a round-robin job dispatcher")]
#[command(version)]
struct Cli {
    /// IP address the server listens on
    #[arg(long, env = "SERVER_IP", default_value = "0.0.0.0")]
    ip: String,

    /// Port the server listens on
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 4000)]
    port: u16,

    /// Access-Control-Allow-Origin value; '*' allows any origin
    #[arg(long, env = "ALLOW_ORIGIN", default_value = "*")]
    allow_origin: String,

    /// Regular expression for allowed origins, used when --allow-origin is empty
    #[arg(long, env = "ALLOW_ORIGIN_PAT")]
    allow_origin_pat: Option<String>,

    /// Send Access-Control-Allow-Credentials
    #[arg(long, env = "ALLOW_CREDENTIALS", default_value_t = true, action = ArgAction::Set)]
    allow_credentials: bool,

    /// Shorthand for --allow-credentials false
    #[arg(long)]
    disallow_credentials: bool,

    /// Directory holding the job worker descriptors
    #[arg(long, env = "JOBS_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Seconds to wait for a job worker before giving up
    #[arg(long, env = "DISPATCH_TIMEOUT_SECS", default_value_t = 5)]
    dispatch_timeout: u64,

    /// Rescan the runtime directory before every dispatch
    #[arg(long)]
    rescan: bool,

    /// Log filter, e.g. "info" or "graphql_jobs=debug"
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Set log level to debug
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real deployments set the environment directly
    let dotenv_result = dotenv();

    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    if let Err(e) = dotenv_result {
        warn!("No .env file loaded: {}", e);
    }

    info!("Starting GraphQL Jobs server...");

    let cors = CorsConfig::new(
        cli.allow_origin,
        cli.allow_origin_pat.as_deref(),
        cli.allow_credentials && !cli.disallow_credentials,
    )?;

    let runtime_dir = cli.runtime_dir.unwrap_or_else(|| runtime_dir(APP_NAME));
    info!("Worker descriptors: {}", runtime_dir.display());

    let config = ServerConfig {
        ip: cli.ip,
        port: cli.port,
        cors,
        dispatcher: DispatcherConfig {
            timeout: Duration::from_secs(cli.dispatch_timeout),
            runtime_dir: Some(runtime_dir),
            rescan_on_dispatch: cli.rescan,
        },
    };

    GraphQLServerBuilder::new()
        .with_config(config)
        .build_and_run()
        .await?;

    Ok(())
}
