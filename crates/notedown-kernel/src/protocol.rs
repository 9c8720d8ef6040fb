//! Wire protocol between the client and a kernel daemon.
//!
//! Messages are newline-delimited JSON (NDJSON). Every request carries the
//! secret from the transport file; the daemon answers with a stream of
//! `{type, data}` messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Execute a notebook (or document) and stream progress back.
    Execute,
    /// Shut the kernel down.
    Abort,
    /// Sent to a freshly launched kernel process on stdin.
    Start,
}

/// A request sent to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub options: Value,
}

impl Request {
    pub fn execute(secret: impl Into<String>, options: Map<String, Value>) -> Self {
        Self {
            command: Command::Execute,
            secret: secret.into(),
            options: Value::Object(options),
        }
    }

    pub fn abort(secret: impl Into<String>) -> Self {
        Self {
            command: Command::Abort,
            secret: secret.into(),
            options: Value::Object(Map::new()),
        }
    }

    /// The launch request. No secret exists yet; the kernel creates one and
    /// writes it to the transport file.
    pub fn start(options: Map<String, Value>) -> Self {
        Self {
            command: Command::Start,
            secret: String::new(),
            options: Value::Object(options),
        }
    }

    /// Serialize request to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse request from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Look up a string option.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Progress output for the user.
    #[serde(alias = "status")]
    Data,
    /// Execution failed; `data` holds the message.
    Error,
    /// The kernel restarted itself; the request must be sent again.
    Restart,
}

/// A message from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub data: String,
}

impl Response {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Data,
            data: data.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Error,
            data: message.into(),
        }
    }

    pub fn restart() -> Self {
        Self {
            kind: ResponseKind::Restart,
            data: String::new(),
        }
    }

    /// Serialize response to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse response from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
