// Worker command table and executor
// Each worker knows a fixed set of named commands and runs them as subprocesses

//! # Command Execution
//!
//! A [`CommandTable`] maps command names to a [`CommandSpec`]: the program to
//! spawn plus an argument list made of literals and named parameters. Request
//! parameters are substituted as separate argv entries and are never pasted
//! into a shell string.
//!
//! [`CommandRunner`] executes a request either as a single reply
//! ([`CommandRunner::handle`]) or as a stream of one message per stdout line
//! followed by a terminal `finished` message ([`CommandRunner::handle_streaming`]).
//! Failures (unknown name, spawn error, non-zero exit) come back as values.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::models::{CommandFailure, CommandOutput, CommandRequest, CommandResponse};
use crate::{JobsError, Result};

/// Prints `$1` down to 1, sleeping `$2` seconds between lines
const COUNTDOWN_SCRIPT: &str = r#"n="$1"
while [ "$n" -gt 0 ]; do
  echo "$n"
  n=$((n - 1))
  if [ "$n" -gt 0 ]; then sleep "$2"; fi
done"#;

/// One argv entry of a command
#[derive(Debug, Clone, PartialEq)]
pub enum ArgTemplate {
    Literal(String),
    /// Taken from the request parameter `name`, or `default` when absent
    Param {
        name: String,
        default: Option<String>,
    },
}

/// How to run one named command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<ArgTemplate>,
    pub description: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            description: String::new(),
        }
    }

    pub fn arg(mut self, literal: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::Literal(literal.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::Param {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn required_param(mut self, name: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::Param {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Build the argv for `request`
    pub fn render_args(&self, request: &CommandRequest) -> Result<Vec<String>> {
        self.args
            .iter()
            .map(|arg| match arg {
                ArgTemplate::Literal(value) => Ok(value.clone()),
                ArgTemplate::Param { name, default } => match request.param(name) {
                    Some(value) => scalar_to_arg(value).ok_or_else(|| {
                        JobsError::InvalidInput(format!(
                            "parameter '{}' must be a string, number or boolean",
                            name
                        ))
                    }),
                    None => default.clone().ok_or_else(|| {
                        JobsError::InvalidInput(format!("missing parameter '{}'", name))
                    }),
                },
            })
            .collect()
    }
}

fn scalar_to_arg(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The fixed set of commands a worker accepts
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: HashMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `countdown`, `date` and `echo`
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(
            "countdown",
            CommandSpec::new("sh")
                .arg("-c")
                .arg(COUNTDOWN_SCRIPT)
                .arg("countdown")
                .param("count", "5")
                .param("interval", "0")
                .describe("Count down from `count`, one line every `interval` seconds"),
        );
        table.register(
            "date",
            CommandSpec::new("date").describe("Print the worker's current date"),
        );
        table.register(
            "echo",
            CommandSpec::new("echo")
                .param("text", "")
                .describe("Print `text`"),
        );
        table
    }

    pub fn register(&mut self, name: impl Into<String>, spec: CommandSpec) {
        self.commands.insert(name.into(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Runs requests against a [`CommandTable`]
#[derive(Debug, Clone)]
pub struct CommandRunner {
    table: CommandTable,
    delay: Duration,
}

impl CommandRunner {
    pub fn new(table: CommandTable) -> Self {
        Self {
            table,
            delay: Duration::ZERO,
        }
    }

    /// Wait this long before starting each job
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Run `request` to completion and return all of its output at once
    pub async fn handle(&self, request: &CommandRequest) -> Result<CommandResponse> {
        self.run(request, None).await
    }

    /// Run `request`, sending one output per stdout line and then a terminal message
    ///
    /// The terminal message carries the failure, if any. Send errors mean the
    /// peer went away and are ignored.
    pub async fn handle_streaming(&self, request: &CommandRequest, sink: &mpsc::Sender<CommandOutput>) {
        let terminal = match self.run(request, Some(sink)).await {
            Ok(_) => CommandOutput::finished(),
            Err(e) => {
                info!("command '{}' failed: {}", request.command, e);
                CommandOutput::failed(CommandFailure::from(&e))
            }
        };
        let _ = sink.send(terminal).await;
    }

    async fn run(
        &self,
        request: &CommandRequest,
        sink: Option<&mpsc::Sender<CommandOutput>>,
    ) -> Result<CommandResponse> {
        let spec = self
            .table
            .get(&request.command)
            .ok_or_else(|| JobsError::UnknownCommand(request.command.clone()))?;
        let args = spec.render_args(request)?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        debug!("spawning {} {:?}", spec.program, args);
        let mut child = Command::new(&spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobsError::CommandExecutionFailed {
                exit_code: None,
                stderr: format!("failed to spawn {}: {}", spec.program, e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobsError::Internal("child stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobsError::Internal("child stderr was not captured".to_string()))?;

        // Drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            BufReader::new(stderr)
                .read_to_string(&mut buffer)
                .await
                .map(|_| buffer)
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut collected = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| output_error("failed to read stdout", e))?
        {
            info!("command read: {}", line);
            if let Some(sink) = sink {
                if sink.send(CommandOutput::line(line.clone())).await.is_err() {
                    return Err(JobsError::Internal("output receiver closed".to_string()));
                }
            }
            collected.push(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| output_error("failed to wait for command", e))?;
        let stderr = stderr_task
            .await
            .map_err(|e| JobsError::Internal(format!("stderr reader failed: {}", e)))?
            .unwrap_or_default();

        if !status.success() {
            return Err(JobsError::CommandExecutionFailed {
                exit_code: status.code(),
                stderr: stderr.trim_end().to_string(),
            });
        }

        Ok(CommandResponse::new(
            request.command.clone(),
            collected,
            status.code().unwrap_or(0),
        ))
    }
}

/// I/O trouble after the child started is a failed run, not a bad request
fn output_error(context: &str, err: std::io::Error) -> JobsError {
    JobsError::CommandExecutionFailed {
        exit_code: None,
        stderr: format!("{}: {}", context, err),
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(CommandTable::with_defaults())
    }
}
