//! Error types
//!
//! User code failures are data (`RuntimeFault`, `CodeError`) because they are
//! routed to the editor rather than propagated. Everything else is a
//! `thiserror` enum returned through `Result`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::controller::RuntimeId;

/// A malformed or misattributed message. Never shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not an object with a string `type` tag")]
    MissingTag,

    #[error("unknown message type `{0}`")]
    UnknownTag(String),

    #[error("`{tag}` is not accepted in this direction")]
    WrongDirection { tag: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("bootstrap `{0}` does not grant script execution")]
    ScriptsDisabled(String),

    #[error("no runtime registered for bootstrap resource `{0}`")]
    UnknownResource(String),

    #[error("failed to spawn sandbox worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("could not create isolated context: {0}")]
    Create(#[from] SandboxError),

    #[error("isolated context {0} is gone")]
    ContextGone(u64),

    #[error("channel has no isolated context; call initialize first")]
    NoContext,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to persist code for `{id}`: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("invalid query window [{begin}, {end})")]
    InvalidWindow { begin: f64, end: f64 },

    #[error("pattern query failed: {0}")]
    Query(String),
}

/// Failure of user code inside a runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeFault {
    pub message: String,
    pub stack: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl RuntimeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// Which kind of failure a `CodeError` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User code failed during evaluation; that run is over.
    Execution,
    /// A dynamic parameter failed mid-frame; the runtime kept rendering with a fallback.
    Parameter,
}

/// A user-visible error, tagged with the runtime that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeError {
    pub message: String,
    pub stack: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub kind: ErrorKind,
    pub source: RuntimeId,
}

impl CodeError {
    pub fn execution(source: RuntimeId, fault: RuntimeFault) -> Self {
        Self {
            message: fault.message,
            stack: fault.stack,
            line: fault.line,
            column: fault.column,
            kind: ErrorKind::Execution,
            source,
        }
    }

    pub fn parameter(source: RuntimeId, message: String, param_name: Option<String>) -> Self {
        let message = match param_name {
            Some(name) => format!("{message} (~{name})"),
            None => message,
        };
        Self {
            message,
            stack: None,
            line: None,
            column: None,
            kind: ErrorKind::Parameter,
            source,
        }
    }
}
