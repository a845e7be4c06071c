// Job worker process - listens for commands and streams results back

//! # Job Server
//!
//! A job server is one worker process. On start it binds a TCP socket, writes
//! its [`WorkerDescriptor`] into the runtime directory, and then serves
//! newline-delimited JSON requests:
//!
//! ```text
//! -> {"command": "countdown", "count": 3}
//! <- {"command": "countdown", "stdout": ["3", "2", "1"], "exit_code": 0, "finished": true, ...}
//!
//! -> {"command": "countdown", "count": 2, "stream": true}
//! <- {"stdout": "2", "finished": false, "timestamp": ...}
//! <- {"stdout": "1", "finished": false, "timestamp": ...}
//! <- {"stdout": null, "finished": true, "timestamp": ...}
//! ```
//!
//! A bad request gets an `invalid_request` failure reply; it never takes the
//! worker down. The descriptor is removed on shutdown (Ctrl-C or SIGTERM).

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::engine::commands::{CommandRunner, CommandTable};
use crate::engine::registry::{runtime_dir, DescriptorFile, APP_NAME};
use crate::models::{CommandFailure, CommandRequest, WorkerDescriptor};
use crate::Result;

/// Longest request line a worker accepts
const MAX_REQUEST_LENGTH: usize = 64 * 1024;

/// Job server configuration
#[derive(Debug, Clone)]
pub struct JobServerConfig {
    /// Address to bind; `*` binds every interface
    pub ip: String,
    /// Port to bind; 0 picks a free one
    pub port: u16,
    /// Where the descriptor file is published
    pub runtime_dir: PathBuf,
    /// Pause before each job starts
    pub delay: Duration,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 0,
            runtime_dir: runtime_dir(APP_NAME),
            delay: Duration::ZERO,
        }
    }
}

/// A job worker, not yet listening
pub struct JobServer {
    config: JobServerConfig,
    commands: CommandTable,
}

impl JobServer {
    pub fn new(config: JobServerConfig) -> Self {
        Self {
            config,
            commands: CommandTable::with_defaults(),
        }
    }

    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    /// Bind the socket and publish the descriptor
    pub async fn bind(self) -> Result<BoundJobServer> {
        let bind_ip = match self.config.ip.as_str() {
            "" | "*" => "0.0.0.0",
            ip => ip,
        };
        let listener = TcpListener::bind((bind_ip, self.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let descriptor = WorkerDescriptor::new(
            std::process::id(),
            self.config.ip.clone(),
            self.config.port,
            local_addr.port(),
        );
        let file = DescriptorFile::publish(&self.config.runtime_dir, &descriptor)?;
        info!("start {}", descriptor);

        let runner = CommandRunner::new(self.commands).with_delay(self.config.delay);
        Ok(BoundJobServer {
            listener,
            local_addr,
            descriptor,
            file,
            runner: Arc::new(runner),
        })
    }

    /// Bind, serve until Ctrl-C / SIGTERM, then clean up
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve(shutdown_signal()).await
    }
}

/// A listening job worker with its descriptor published
pub struct BoundJobServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    descriptor: WorkerDescriptor,
    file: DescriptorFile,
    runner: Arc<CommandRunner>,
}

impl BoundJobServer {
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn descriptor_path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("JobServer interrupted...");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {}", peer);
                        let runner = self.runner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, runner).await {
                                warn!("connection from {} ended with error: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }

        self.file.remove()
    }
}

async fn serve_connection(stream: TcpStream, runner: Arc<CommandRunner>) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH));

    while let Some(line) = framed.next().await {
        let line = line?;
        let request: CommandRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid request {:?}: {}", line, e);
                let reply = CommandFailure::invalid_request(format!(
                    "command must be specified in a request: {}",
                    e
                ))
                .into_reply("");
                framed.send(reply.to_string()).await?;
                continue;
            }
        };
        info!("request: {:?}", request);

        if request.stream {
            let (tx, mut rx) = mpsc::channel(64);
            let job_runner = runner.clone();
            let job_request = request.clone();
            let job = tokio::spawn(async move {
                job_runner.handle_streaming(&job_request, &tx).await;
            });

            while let Some(output) = rx.recv().await {
                framed.send(serde_json::to_string(&output)?).await?;
            }
            job.await?;
        } else {
            let reply = match runner.handle(&request).await {
                Ok(response) => serde_json::to_value(response)?,
                Err(e) => {
                    info!("command '{}' failed: {}", request.command, e);
                    CommandFailure::from(&e).into_reply(&request.command)
                }
            };
            framed.send(reply.to_string()).await?;
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::{Dispatcher, DispatcherConfig, TcpTransport};
    use crate::engine::registry::list_workers;
    use crate::JobsError;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;

    struct RunningWorker {
        descriptor: WorkerDescriptor,
        descriptor_path: PathBuf,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start_worker(dir: &std::path::Path) -> RunningWorker {
        let server = JobServer::new(JobServerConfig {
            runtime_dir: dir.to_path_buf(),
            ..Default::default()
        })
        .bind()
        .await
        .unwrap();

        let descriptor = server.descriptor().clone();
        let descriptor_path = server.descriptor_path().to_path_buf();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        RunningWorker {
            descriptor,
            descriptor_path,
            stop,
            handle,
        }
    }

    #[tokio::test]
    async fn test_worker_publishes_and_removes_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let worker = start_worker(dir.path()).await;

        assert!(worker.descriptor_path.exists());
        assert_eq!(list_workers(dir.path()), vec![worker.descriptor.clone()]);

        worker.stop.send(()).unwrap();
        worker.handle.await.unwrap().unwrap();
        assert!(!worker.descriptor_path.exists());
    }

    #[tokio::test]
    async fn test_dispatch_to_real_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = start_worker(dir.path()).await;

        let dispatcher = Dispatcher::discover(DispatcherConfig {
            runtime_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });

        let reply = dispatcher
            .dispatch(CommandRequest::new("countdown").with_param("count", 2))
            .await
            .unwrap();
        assert_eq!(reply["stdout"], serde_json::json!(["2", "1"]));
        assert_eq!(reply["finished"], true);

        let reply = dispatcher.dispatch(CommandRequest::new("reboot")).await.unwrap();
        assert_eq!(reply["error"]["kind"], "unknown_command");

        worker.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_streaming_through_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let worker = start_worker(dir.path()).await;
        let dispatcher = Dispatcher::new(
            vec![worker.descriptor.clone()],
            Arc::new(TcpTransport),
            DispatcherConfig::default(),
        );

        let outputs: Vec<_> = dispatcher
            .dispatch_stream(CommandRequest::new("countdown").with_param("count", 3))
            .await
            .unwrap()
            .collect()
            .await;

        let lines: Vec<_> = outputs
            .iter()
            .filter_map(|o| o.as_ref().unwrap().stdout.clone())
            .collect();
        assert_eq!(lines, vec!["3", "2", "1"]);
        assert!(outputs.last().unwrap().as_ref().unwrap().finished);

        worker.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_failure_reply() {
        let dir = tempfile::tempdir().unwrap();
        let worker = start_worker(dir.path()).await;

        let stream = TcpStream::connect(worker.descriptor.address()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"{\"interval\": 1}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["error"]["kind"], "invalid_request");

        // The connection stays usable after a bad request
        write_half.write_all(b"{\"command\": \"echo\", \"text\": \"still here\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["stdout"], serde_json::json!(["still here"]));

        worker.stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_stale_descriptor_fails_only_its_turn() {
        let live_dir = tempfile::tempdir().unwrap();
        let worker = start_worker(live_dir.path()).await;

        // A descriptor whose process is gone: bind and drop a listener to get a dead port
        let dead_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let stale = WorkerDescriptor::new(999_999, "127.0.0.1", 0, dead_port);

        let dispatcher = Dispatcher::new(
            vec![worker.descriptor.clone(), stale],
            Arc::new(TcpTransport),
            DispatcherConfig::default(),
        );

        assert!(dispatcher.dispatch(CommandRequest::new("date")).await.is_ok());
        assert!(matches!(
            dispatcher.dispatch(CommandRequest::new("date")).await,
            Err(JobsError::WorkerUnreachable { .. })
        ));
        assert!(dispatcher.dispatch(CommandRequest::new("date")).await.is_ok());

        worker.stop.send(()).unwrap();
    }
}
