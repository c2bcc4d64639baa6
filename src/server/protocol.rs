//! Client command protocol
//!
//! Transport-agnostic request/reply envelopes:
//! `{command, ...params}` in, `{command, data}` out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChannelError, DispatchError};

/// A decoded client request. Params share the top-level object with `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Decode a JSON object into a request. Anything else is a protocol violation.
    pub fn decode(raw: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(raw).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

/// Reply envelope written back to the originating channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub command: String,
    pub data: Value,
}

impl Reply {
    pub fn new(command: impl Into<String>, data: Value) -> Self {
        Self {
            command: command.into(),
            data,
        }
    }
}

/// Error payload for an unrecognised command
pub fn unknown_command_payload() -> Value {
    Value::String("error".to_string())
}

/// Error payload for a failed request
pub fn error_payload(message: impl Into<String>) -> Value {
    serde_json::json!({
        "error": true,
        "message": message.into(),
    })
}

/// Error payload for a failure inside a language identification handler
pub fn classifier_error_payload(error: &DispatchError) -> Value {
    let message = error.to_string();
    if error.is_lookup() {
        error_payload(format!("Server returned a LookupError:\n{}", message.trim()))
    } else {
        error_payload(format!("Server returned an error:\n{}", message.trim()))
    }
}

/// Command name constants
pub mod commands {
    pub const VIEW: &str = "view";
    pub const META: &str = "meta";
    pub const UPDATE: &str = "update";
    pub const SEARCH: &str = "search";
    pub const LITERAL_QUERY: &str = "literal_query";
    pub const DROP: &str = "drop";
    pub const RECREATE: &str = "recreate";
    pub const LANGID: &str = "langid";
    pub const RETRAIN: &str = "retrain";
    pub const FEATURES: &str = "features";
    pub const MOTD: &str = "motd";
    pub const RESTART: &str = "restart";
    pub const SHUTDOWN: &str = "shutdown";
}
