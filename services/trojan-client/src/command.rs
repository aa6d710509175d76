//! Command envelope and result types for the control protocol.
//!
//! Requests are JSON objects tagged by `command`:
//!
//! ```json
//! {"command": "add", "port": 5, "password": "<hash>"}
//! {"command": "flow", "options": {"clear": true, "startTime": 0}}
//! ```
//!
//! Responses are `{"code": <status>, "data": <result>}`.

use serde::{Deserialize, Serialize};

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    /// List every ledger account.
    List,

    /// Create an account unless its id already exists.
    Add {
        #[serde(default)]
        port: i64,
        #[serde(default)]
        password: String,
    },

    /// Delete an account.
    #[serde(rename = "del")]
    Delete {
        #[serde(default)]
        port: i64,
    },

    /// Replace an account's password hash.
    ChangePassword {
        #[serde(default)]
        port: i64,
        #[serde(default)]
        password: String,
    },

    /// Summarize archived traffic.
    Flow {
        #[serde(default)]
        options: FlowOptions,
    },

    /// Report the client version.
    Version,
}

impl Command {
    /// Parse a JSON envelope.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Add { .. } => "add",
            Self::Delete { .. } => "del",
            Self::ChangePassword { .. } => "changePassword",
            Self::Flow { .. } => "flow",
            Self::Version => "version",
        }
    }
}

/// Options carried by a `flow` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOptions {
    /// Delete the summarized records afterwards.
    #[serde(default)]
    pub clear: bool,

    /// Range start in epoch milliseconds, inclusive. Defaults to 0.
    #[serde(default)]
    pub start_time: Option<i64>,

    /// Range end in epoch milliseconds, exclusive. Defaults to now.
    #[serde(default)]
    pub end_time: Option<i64>,
}

/// One account in a `list` or `changePassword` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortPassword {
    pub port: i64,
    pub password: String,
}

/// Result of `add` and `del`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRef {
    pub port: i64,
}

/// One account in a `flow` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFlow {
    pub port: i64,
    pub sum_flow: i64,
}

/// Result of `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: String,
}

/// Typed result of a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandResult {
    List(Vec<PortPassword>),
    Add(PortRef),
    Delete(PortRef),
    ChangePassword(PortPassword),
    Flow(Vec<PortFlow>),
    Version(VersionInfo),
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidCommand,
    AuthFailure,
    Error,
}

impl StatusCode {
    /// Numeric code sent to the manager.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidCommand => 1,
            Self::AuthFailure => 2,
            Self::Error => -1,
        }
    }
}

/// Response body sent back over the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub code: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<CommandResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    /// Successful response carrying a result.
    pub fn ok(data: CommandResult) -> Self {
        Self {
            code: StatusCode::Ok.as_i32(),
            data: Some(data),
            message: None,
        }
    }

    /// Failure response.
    pub fn failure(status: StatusCode, message: Option<String>) -> Self {
        Self {
            code: status.as_i32(),
            data: None,
            message,
        }
    }
}
