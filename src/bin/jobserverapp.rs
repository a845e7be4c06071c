// GraphQL Jobs - Job Worker Launcher
// Run with: cargo run --bin jobserverapp -- --num 3

//! # Job Worker Launcher
//!
//! Starts `--num` `jobserver` processes from the same directory as this
//! binary, waits for Ctrl-C and then stops them. Workers get the port at the
//! same position in `--ports`, or a free port when the list runs out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use graphql_jobs::{engine::registry::descriptor_path, runtime_dir, APP_NAME};

/// How long workers get to remove their descriptors before being killed
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "graphql-jobs-jobserverapp")]
#[command(about = "Launch several job workers for the GraphQL Jobs server")]
#[command(version)]
struct Cli {
    /// Number of workers
    #[arg(short, long, default_value_t = 3)]
    num: usize,

    /// Comma separated ports, one per worker
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,

    /// IP address the workers bind
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Seconds each worker waits before running a job
    #[arg(long, default_value_t = 0.0)]
    sleep: f64,

    /// Directory for the worker descriptors
    #[arg(long, env = "JOBS_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Log filter
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Set log level to debug
    #[arg(short, long)]
    debug: bool,
}

fn jobserver_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let dir = exe
        .parent()
        .context("current executable has no parent directory")?;
    Ok(dir.join(format!("jobserver{}", std::env::consts::EXE_SUFFIX)))
}

fn spawn_worker(cli: &Cli, program: &Path, runtime_dir: &Path, port: u16) -> Result<Child> {
    let mut command = Command::new(program);
    command
        .arg("--ip")
        .arg(&cli.ip)
        .arg("--port")
        .arg(port.to_string())
        .arg("--sleep")
        .arg(cli.sleep.to_string())
        .arg("--runtime-dir")
        .arg(runtime_dir)
        .arg("--log-level")
        .arg(if cli.debug { "debug" } else { cli.log_level.as_str() })
        .kill_on_drop(true);

    command
        .spawn()
        .with_context(|| format!("spawning {}", program.display()))
}

/// How a worker ended during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    Exited,
    Killed,
}

/// Ask a worker to shut down cleanly
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // None means the child was already reaped
    let Some(pid) = child.id() else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!("sending SIGTERM to jobserver {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// Wait for a terminated worker to exit, killing it after `grace`
async fn stop_worker(mut child: Child, runtime_dir: &Path, grace: Duration) -> Stopped {
    let pid = child.id();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!("jobserver {:?} exited: {}", pid, status);
            Stopped::Exited
        }
        Ok(Err(e)) => {
            error!("waiting for jobserver {:?}: {}", pid, e);
            Stopped::Exited
        }
        Err(_) => {
            warn!("jobserver {:?} did not stop in time, killing it", pid);
            if let Err(e) = child.kill().await {
                error!("killing jobserver {:?}: {}", pid, e);
            }
            // a killed worker cannot clean up after itself
            if let Some(pid) = pid {
                let _ = std::fs::remove_file(descriptor_path(runtime_dir, pid));
            }
            Stopped::Killed
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let program = jobserver_path()?;
    let runtime_dir = cli
        .runtime_dir
        .clone()
        .unwrap_or_else(|| runtime_dir(APP_NAME));

    let mut children = Vec::with_capacity(cli.num);
    for index in 0..cli.num {
        let port = cli.ports.get(index).copied().unwrap_or(0);
        let child = spawn_worker(&cli, &program, &runtime_dir, port)?;
        info!("started jobserver #{} pid={:?} port={}", index, child.id(), port);
        children.push(child);
    }

    info!("{} job worker(s) running, press Ctrl-C to stop", children.len());
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("stopping job workers");
    // Workers started from a terminal may already have the SIGINT; a second
    // request to stop is harmless
    for child in &children {
        terminate(child);
    }
    for child in children {
        stop_worker(child, &runtime_dir, STOP_GRACE).await;
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminated_worker_exits_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();

        terminate(&child);
        let stopped = stop_worker(child, dir.path(), Duration::from_secs(5)).await;
        assert_eq!(stopped, Stopped::Exited);
    }

    #[tokio::test]
    async fn test_worker_ignoring_terminate_is_killed_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while :; do sleep 0.1; done")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let descriptor = descriptor_path(dir.path(), child.id().unwrap());
        std::fs::write(&descriptor, "{}").unwrap();

        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate(&child);
        let stopped = stop_worker(child, dir.path(), Duration::from_millis(500)).await;

        assert_eq!(stopped, Stopped::Killed);
        assert!(!descriptor.exists());
    }
}
