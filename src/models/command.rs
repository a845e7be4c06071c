// Command wire messages exchanged between the dispatcher and a job worker
// Every message is one JSON object on its own line

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::JobsError;

/// Seconds since the Unix epoch, with sub-second precision
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A request for a worker to run one named command
///
/// Any fields besides `command` and `stream` are command parameters:
/// `{"command": "countdown", "count": 3, "interval": 1}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,

    /// Ask the worker for one message per output line instead of a single reply
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stream: false,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Merge an object of parameters; non-object values are rejected
    pub fn with_params(mut self, params: Value) -> crate::Result<Self> {
        match params {
            Value::Object(map) => {
                for (name, value) in map {
                    match name.as_str() {
                        "command" | "stream" => {}
                        _ => {
                            self.params.insert(name, value);
                        }
                    }
                }
                Ok(self)
            }
            Value::Null => Ok(self),
            other => Err(JobsError::InvalidInput(format!(
                "command params must be an object, got {}",
                other
            ))),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// Why a worker could not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownCommand,
    CommandExecutionFailed,
    InvalidRequest,
}

/// A worker-side failure, sent back as data instead of tearing down the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl CommandFailure {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::InvalidRequest,
            message: message.into(),
            exit_code: None,
            stderr: None,
        }
    }

    /// The single reply a non-streaming request gets when it fails
    pub fn into_reply(self, command: &str) -> Value {
        serde_json::json!({
            "command": command,
            "finished": true,
            "timestamp": now_timestamp(),
            "error": self,
        })
    }
}

impl From<&JobsError> for CommandFailure {
    fn from(err: &JobsError) -> Self {
        match err {
            JobsError::UnknownCommand(_) => Self {
                kind: FailureKind::UnknownCommand,
                message: err.to_string(),
                exit_code: None,
                stderr: None,
            },
            JobsError::CommandExecutionFailed { exit_code, stderr } => Self {
                kind: FailureKind::CommandExecutionFailed,
                message: err.to_string(),
                exit_code: *exit_code,
                stderr: Some(stderr.clone()),
            },
            JobsError::InvalidInput(_)
            | JobsError::Serialization(_)
            | JobsError::InvalidSubscriptionMessage(_) => Self::invalid_request(err.to_string()),
            other => Self {
                kind: FailureKind::CommandExecutionFailed,
                message: other.to_string(),
                exit_code: None,
                stderr: None,
            },
        }
    }
}

/// One streamed message: a line of stdout, or the terminal `finished` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: Option<String>,
    pub finished: bool,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
}

impl CommandOutput {
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            stdout: Some(line.into()),
            finished: false,
            timestamp: now_timestamp(),
            error: None,
        }
    }

    pub fn finished() -> Self {
        Self {
            stdout: None,
            finished: true,
            timestamp: now_timestamp(),
            error: None,
        }
    }

    pub fn failed(failure: CommandFailure) -> Self {
        Self {
            error: Some(failure),
            ..Self::finished()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The single reply to a non-streaming command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: String,
    pub stdout: Vec<String>,
    pub exit_code: i32,
    pub finished: bool,
    pub timestamp: f64,
}

impl CommandResponse {
    pub fn new(command: impl Into<String>, stdout: Vec<String>, exit_code: i32) -> Self {
        Self {
            command: command.into(),
            stdout,
            exit_code,
            finished: true,
            timestamp: now_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_extra_fields_as_params() {
        let request: CommandRequest =
            serde_json::from_value(json!({"command": "countdown", "count": 3, "interval": 0}))
                .unwrap();

        assert_eq!(request.command, "countdown");
        assert!(!request.stream);
        assert_eq!(request.param("count"), Some(&json!(3)));
        assert_eq!(request.param("interval"), Some(&json!(0)));
    }

    #[test]
    fn test_request_serializes_flat() {
        let request = CommandRequest::new("echo").with_param("text", "hi").streaming();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"command": "echo", "stream": true, "text": "hi"})
        );
    }

    #[test]
    fn test_with_params_rejects_non_objects() {
        assert!(CommandRequest::new("echo").with_params(json!([1, 2])).is_err());

        let request = CommandRequest::new("echo")
            .with_params(json!({"text": "hi", "command": "date"}))
            .unwrap();
        assert_eq!(request.command, "echo");
        assert_eq!(request.param("text"), Some(&json!("hi")));
        assert!(request.param("command").is_none());
    }

    #[test]
    fn test_failure_from_execution_error() {
        let err = JobsError::CommandExecutionFailed {
            exit_code: Some(2),
            stderr: "boom".to_string(),
        };
        let failure = CommandFailure::from(&err);

        assert_eq!(failure.kind, FailureKind::CommandExecutionFailed);
        assert_eq!(failure.exit_code, Some(2));
        assert_eq!(failure.stderr.as_deref(), Some("boom"));

        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["kind"], "command_execution_failed");
    }

    #[test]
    fn test_failure_kind_follows_error_origin() {
        let bad_request = CommandFailure::from(&JobsError::InvalidInput("count".to_string()));
        assert_eq!(bad_request.kind, FailureKind::InvalidRequest);

        let broken_run = CommandFailure::from(&JobsError::Internal("pipe closed".to_string()));
        assert_eq!(broken_run.kind, FailureKind::CommandExecutionFailed);
        assert_eq!(broken_run.exit_code, None);
    }

    #[test]
    fn test_terminal_output_shape() {
        let value = serde_json::to_value(CommandOutput::finished()).unwrap();
        assert_eq!(value["stdout"], Value::Null);
        assert_eq!(value["finished"], true);
        assert!(value.get("error").is_none());
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }
}
