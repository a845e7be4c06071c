// Worker descriptor - the record a job worker publishes so the server can find it

use serde::{Deserialize, Serialize};

/// Published address of a running job worker
///
/// Written as JSON to `<runtime dir>/jobserver-<pid>` when the worker boots and
/// removed when it exits. Older workers wrote the bound port as `zmq_port`,
/// so that name is still accepted. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub pid: u32,
    pub ip: String,
    /// The port the worker was asked to bind (0 means "pick one")
    pub port: u16,
    /// The port the worker actually bound
    #[serde(default, alias = "zmq_port", skip_serializing_if = "Option::is_none")]
    pub command_port: Option<u16>,
}

impl WorkerDescriptor {
    pub fn new(pid: u32, ip: impl Into<String>, port: u16, command_port: u16) -> Self {
        Self {
            pid,
            ip: ip.into(),
            port,
            command_port: Some(command_port),
        }
    }

    /// The port a dispatcher should connect to
    pub fn connect_port(&self) -> u16 {
        self.command_port.unwrap_or(self.port)
    }

    /// `host:port` to connect to; wildcard bind addresses map to loopback
    pub fn address(&self) -> String {
        let host = match self.ip.as_str() {
            "" | "*" | "0.0.0.0" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        };
        format!("{}:{}", host, self.connect_port())
    }
}

impl std::fmt::Display for WorkerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<jobserver pid={} ip={} port={}>", self.pid, self.ip, self.connect_port())
    }
}
