// Test doubles shared by the schema, HTTP and WebSocket tests

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::dispatcher::{Dispatcher, DispatcherConfig, OutputStream, WorkerTransport};
use crate::models::{CommandOutput, CommandRequest, WorkerDescriptor};

/// Answers every command as if it printed `lines`
pub struct ScriptedTransport {
    pub lines: Vec<String>,
}

impl ScriptedTransport {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }
}

#[async_trait]
impl WorkerTransport for ScriptedTransport {
    async fn request(
        &self,
        worker: &WorkerDescriptor,
        request: &CommandRequest,
    ) -> anyhow::Result<Value> {
        Ok(json!({
            "command": request.command,
            "stdout": self.lines,
            "exit_code": 0,
            "finished": true,
            "worker": worker.pid,
        }))
    }

    async fn open_stream(
        &self,
        _worker: &WorkerDescriptor,
        _request: &CommandRequest,
    ) -> anyhow::Result<OutputStream> {
        let mut outputs: Vec<anyhow::Result<CommandOutput>> = self
            .lines
            .iter()
            .map(|line| Ok(CommandOutput::line(line.clone())))
            .collect();
        outputs.push(Ok(CommandOutput::finished()));
        Ok(Box::pin(futures::stream::iter(outputs)))
    }
}

pub fn worker(pid: u32) -> WorkerDescriptor {
    WorkerDescriptor::new(pid, "127.0.0.1", 0, 40000 + pid as u16)
}

/// Dispatcher over `pids` answering with `lines`
pub fn scripted_dispatcher(pids: &[u32], lines: &[&str]) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        pids.iter().copied().map(worker).collect(),
        Arc::new(ScriptedTransport::new(lines)),
        DispatcherConfig::default(),
    ))
}
