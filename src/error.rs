//! Error taxonomy for the session engine.
//!
//! Transport failures are fatal to the whole session and surface to every
//! pending consumer; server and protocol errors are fatal only to the
//! channel or call that was waiting on the offending message.

use core::fmt;

use serde::Deserialize;
use serde_json::Value;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport unreachable or broken; the session is terminated and every
    /// pending consumer is released with this error.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// The server explicitly rejected the authentication handshake.
    #[error("authentication failed: {details}")]
    Authentication { details: Value },

    /// The server reported an operation-level failure for one channel/call.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A message shape did not match any recognized variant. Indicates a
    /// client/server version mismatch or an internal bug; fatal to the
    /// specific channel or call, never to unrelated consumers.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The caller misused the API (result read before completion, submission
    /// to a terminated worker, and so on).
    #[error("usage error: {message}")]
    Usage { message: String },
}

impl Error {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Error::Usage {
            message: message.into(),
        }
    }
}

/// Discriminates server errors by the `displayData.code` field the server
/// attaches to its structured error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Generic,
    /// No model matched the given specifier (`generic.noModelMatchingQuery`).
    ModelNotFound,
    /// No preset config matched the given identifier (`generic.presetNotFound`).
    PresetNotFound,
    /// The server closed a streaming channel before the operation completed.
    ChannelClosed,
    /// Failure reported while a prediction was in flight.
    Prediction,
}

/// Structured error detail reported by the server.
///
/// The `stack` field the server sometimes attaches is stripped before
/// parsing; it describes the server's internals, not the failed operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorDetail {
    pub title: Option<String>,
    pub root_title: Option<String>,
    pub display_data: Option<Value>,
    pub error_data: Option<Value>,
    pub cause: Option<String>,
    pub suggestion: Option<String>,
}

/// An operation-level failure reported by the server, carrying whatever
/// structured detail the server supplied.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    /// Local context ("Model load error", "RPC error", ...).
    pub message: String,
    /// Parsed detail, when the payload matched the extended error shape.
    pub detail: Option<ErrorDetail>,
    /// The raw error payload, minus the server-side stack trace.
    pub raw: Option<Value>,
}

impl ServerError {
    /// Build a server error from the raw error payload of a `channelError`,
    /// `rpcError`, or in-channel error message.
    pub fn from_details(message: impl Into<String>, details: Value) -> Self {
        let mut raw = details;
        if let Some(map) = raw.as_object_mut() {
            map.remove("stack");
        }
        let detail: Option<ErrorDetail> = serde_json::from_value(raw.clone()).ok();
        let kind = detail
            .as_ref()
            .and_then(|d| d.display_data.as_ref())
            .and_then(|d| d.get("code"))
            .and_then(Value::as_str)
            .map(|code| match code {
                "generic.noModelMatchingQuery" => ServerErrorKind::ModelNotFound,
                "generic.presetNotFound" => ServerErrorKind::PresetNotFound,
                _ => ServerErrorKind::Generic,
            })
            .unwrap_or(ServerErrorKind::Generic);
        ServerError {
            kind,
            message: message.into(),
            detail,
            raw: Some(raw),
        }
    }

    /// A streaming channel was closed by the server before its operation
    /// reached a terminal event.
    pub fn channel_closed(message: impl Into<String>) -> Self {
        ServerError {
            kind: ServerErrorKind::ChannelClosed,
            message: message.into(),
            detail: None,
            raw: None,
        }
    }

    pub(crate) fn with_kind(mut self, kind: ServerErrorKind) -> Self {
        self.kind = kind;
        self
    }

    fn header(&self) -> Option<String> {
        let detail = self.detail.as_ref()?;
        match (&detail.title, &detail.root_title) {
            (Some(title), Some(root)) if root != title => Some(format!("{root}: {title}")),
            (Some(title), _) => Some(title.clone()),
            (None, Some(root)) => Some(root.clone()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        let Some(detail) = self.detail.as_ref() else {
            if let Some(raw) = self.raw.as_ref() {
                write!(f, ": {raw}")?;
            }
            return Ok(());
        };
        let header = self.header().unwrap_or_else(|| {
            self.raw
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "Unknown remote error".to_string())
        });
        write!(f, ": {header}")?;
        if let Some(data) = detail.display_data.as_ref() {
            write!(f, "\n  Additional information from server:\n    {data}")?;
        }
        if let Some(data) = detail.error_data.as_ref() {
            write!(f, "\n  Error details from server:\n    {data}")?;
        }
        if let Some(cause) = detail.cause.as_ref() {
            write!(f, "\n  Reported cause:\n    {cause}")?;
        }
        if let Some(suggestion) = detail.suggestion.as_ref() {
            write!(f, "\n  Suggested potential remedy:\n    {suggestion}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}
