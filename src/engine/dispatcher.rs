// Round-robin dispatcher - forwards commands to job workers

//! # Dispatcher
//!
//! The dispatcher owns the list of known workers and a single rotation cursor.
//! Every call picks `workers[cursor % len]`, advances the cursor, opens a new
//! connection to that worker, sends one command and relays the reply unchanged.
//!
//! ## Rotation Policy
//!
//! The cursor advances **before** the exchange happens and regardless of its
//! outcome. A worker that is down costs one failed dispatch per rotation but
//! never stalls the others.
//!
//! ## Transport
//!
//! [`WorkerTransport`] is the seam between selection and the wire. The default
//! [`TcpTransport`] speaks newline-delimited JSON over a fresh TCP connection.
//! Connections are not pooled; this path carries low-volume admin commands.
//!
//! ## Rust Learning Notes:
//!
//! ### One Lock for Shared State
//! The worker list and the cursor live in the same `Mutex`, so a selection
//! always sees a cursor that matches the list it indexes into. The lock is
//! held only for the read-and-advance step, never across an `.await`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::engine::registry::list_workers;
use crate::models::{CommandOutput, CommandRequest, WorkerDescriptor};
use crate::{JobsError, Result};

/// Longest line accepted from a worker
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Raw output stream from a worker connection, ending when the socket closes
pub type OutputStream = BoxStream<'static, anyhow::Result<CommandOutput>>;

/// Moves one command to one worker and brings the answer back
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Send `request` and wait for exactly one reply message
    async fn request(
        &self,
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<Value>;

    /// Send `request` and return every message the worker writes back
    async fn open_stream(
        &self,
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<OutputStream>;
}

/// Newline-delimited JSON over a transient TCP connection
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    async fn send(
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<Framed<TcpStream, LinesCodec>> {
        let address = worker.address();
        let stream = TcpStream::connect(address.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", address))?;

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        framed
            .send(serde_json::to_string(request)?)
            .await
            .with_context(|| format!("failed to send command to {}", address))?;
        Ok(framed)
    }
}

#[async_trait]
impl WorkerTransport for TcpTransport {
    async fn request(
        &self,
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<Value> {
        let mut framed = Self::send(worker, request).await?;

        let line = framed
            .next()
            .await
            .ok_or_else(|| anyhow!("connection closed before a reply arrived"))??;
        Ok(serde_json::from_str(&line)?)
    }

    async fn open_stream(
        &self,
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<OutputStream> {
        let framed = Self::send(worker, request).await?;

        Ok(framed
            .map(|line| -> anyhow::Result<CommandOutput> {
                let line = line?;
                Ok(serde_json::from_str::<CommandOutput>(&line)?)
            })
            .boxed())
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a whole unary exchange, and for the gap between two streamed messages
    pub timeout: Duration,
    /// Where worker descriptors are published; enables [`Dispatcher::refresh`]
    pub runtime_dir: Option<PathBuf>,
    /// Rescan `runtime_dir` before every dispatch
    pub rescan_on_dispatch: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            runtime_dir: None,
            rescan_on_dispatch: false,
        }
    }
}

struct Rotation {
    workers: Vec<WorkerDescriptor>,
    cursor: usize,
}

/// Round-robin command dispatcher
pub struct Dispatcher {
    rotation: Mutex<Rotation>,
    transport: Arc<dyn WorkerTransport>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<WorkerDescriptor>,
        transport: Arc<dyn WorkerTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            rotation: Mutex::new(Rotation { workers, cursor: 0 }),
            transport,
            config,
        }
    }

    /// Dispatcher over TCP with workers discovered from `config.runtime_dir`
    pub fn discover(config: DispatcherConfig) -> Self {
        let workers = config
            .runtime_dir
            .as_deref()
            .map(list_workers)
            .unwrap_or_default();
        info!("Discovered {} job worker(s)", workers.len());
        Self::new(workers, Arc::new(TcpTransport), config)
    }

    fn rotation(&self) -> MutexGuard<'_, Rotation> {
        // The guarded data stays consistent even if a holder panicked
        self.rotation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Snapshot of the current worker list
    pub fn workers(&self) -> Vec<WorkerDescriptor> {
        self.rotation().workers.clone()
    }

    /// Current cursor position (always `< len` once a dispatch happened)
    pub fn cursor(&self) -> usize {
        self.rotation().cursor
    }

    /// Replace the worker list, keeping the cursor in range
    pub fn set_workers(&self, workers: Vec<WorkerDescriptor>) {
        let mut rotation = self.rotation();
        rotation.cursor = if workers.is_empty() {
            0
        } else {
            rotation.cursor % workers.len()
        };
        rotation.workers = workers;
    }

    /// Rescan the runtime directory; returns the number of workers now known
    ///
    /// The directory is read on the blocking pool. If the scan task fails the
    /// current list is kept.
    pub async fn refresh(&self) -> usize {
        let Some(dir) = self.config.runtime_dir.clone() else {
            return self.rotation().workers.len();
        };

        match tokio::task::spawn_blocking(move || list_workers(&dir)).await {
            Ok(workers) => {
                let count = workers.len();
                self.set_workers(workers);
                debug!("Refreshed worker list: {} worker(s)", count);
                count
            }
            Err(e) => {
                warn!("Worker rescan failed: {}", e);
                self.rotation().workers.len()
            }
        }
    }

    /// Pick the next worker and advance the cursor
    pub fn select_worker(&self) -> Result<(usize, WorkerDescriptor)> {
        let mut rotation = self.rotation();
        let len = rotation.workers.len();
        if len == 0 {
            return Err(JobsError::NoWorkersAvailable);
        }

        let index = rotation.cursor % len;
        rotation.cursor = (index + 1) % len;
        Ok((index, rotation.workers[index].clone()))
    }

    async fn prepare(&self) -> Result<(usize, WorkerDescriptor)> {
        if self.config.rescan_on_dispatch {
            self.refresh().await;
        }
        self.select_worker()
    }

    /// Send one command to the next worker and return its reply unchanged
    pub async fn dispatch(&self, request: CommandRequest) -> Result<Value> {
        let (index, worker) = self.prepare().await?;
        debug!("Dispatching '{}' to worker #{} {}", request.command, index, worker);

        let exchange = self.transport.request(&worker, &request);
        match tokio::time::timeout(self.config.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!("Dispatch to {} failed: {:#}", worker, e);
                Err(JobsError::WorkerUnreachable {
                    worker,
                    reason: format!("{:#}", e),
                })
            }
            Err(_) => {
                warn!("Dispatch to {} timed out", worker);
                Err(JobsError::WorkerUnreachable {
                    worker,
                    reason: format!("no reply within {:?}", self.config.timeout),
                })
            }
        }
    }

    /// Send a streaming command to the next worker
    ///
    /// The returned stream yields every output message up to and including the
    /// one with `finished == true`. If the worker goes quiet for longer than the
    /// configured timeout, or the connection closes first, the stream ends with
    /// an error instead.
    pub async fn dispatch_stream(
        &self,
        request: CommandRequest,
    ) -> Result<BoxStream<'static, Result<CommandOutput>>> {
        let (index, worker) = self.prepare().await?;
        let request = request.streaming();
        debug!("Streaming '{}' from worker #{} {}", request.command, index, worker);

        let timeout = self.config.timeout;
        let opened = self.transport.open_stream(&worker, &request);
        let inner = match tokio::time::timeout(timeout, opened).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(e)) => {
                return Err(JobsError::WorkerUnreachable {
                    worker,
                    reason: format!("{:#}", e),
                })
            }
            Err(_) => {
                return Err(JobsError::WorkerUnreachable {
                    worker,
                    reason: format!("no connection within {:?}", timeout),
                })
            }
        };

        Ok(relay_outputs(inner, worker, timeout))
    }
}

/// Stop after the terminal message and turn transport trouble into errors
fn relay_outputs(
    inner: OutputStream,
    worker: WorkerDescriptor,
    timeout: Duration,
) -> BoxStream<'static, Result<CommandOutput>> {
    futures::stream::unfold(Some(inner), move |state| {
        let worker = worker.clone();
        async move {
            let mut inner = state?;
            match tokio::time::timeout(timeout, inner.next()).await {
                Ok(Some(Ok(output))) => {
                    let next = if output.finished { None } else { Some(inner) };
                    Some((Ok(output), next))
                }
                Ok(Some(Err(e))) => Some((
                    Err(JobsError::WorkerUnreachable {
                        worker,
                        reason: format!("{:#}", e),
                    }),
                    None,
                )),
                Ok(None) => Some((Err(JobsError::IncompleteOutput), None)),
                Err(_) => Some((
                    Err(JobsError::WorkerUnreachable {
                        worker,
                        reason: format!("no output within {:?}", timeout),
                    }),
                    None,
                )),
            }
        }
    })
    .boxed()
}
