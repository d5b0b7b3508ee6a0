//! Remote procedure call correlation.
//!
//! A call pairs one outbound request with exactly one inbound response or
//! error, matched by call id. The handler is pure protocol logic shared by
//! both facades; waiting on the reply queue is the facade's job.

use serde_json::Value;

use crate::error::{Error, Result, ServerError};
use crate::wire::{ClientEnvelope, ServerEnvelope};

/// Builds the request envelope for one call and interprets its response.
pub struct RemoteCallHandler {
    call_id: u64,
    notice_prefix: &'static str,
}

impl RemoteCallHandler {
    pub fn new(call_id: u64) -> Self {
        RemoteCallHandler {
            call_id,
            notice_prefix: "RPC",
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// The envelope to send to initiate this call.
    pub fn call_envelope(&self, endpoint: &str, parameter: Option<Value>) -> ClientEnvelope {
        ClientEnvelope::RpcCall {
            endpoint: endpoint.to_string(),
            call_id: self.call_id,
            parameter,
        }
    }

    /// Interpret the single response delivered for this call.
    ///
    /// Three shapes are accepted: success with a payload, success with no
    /// payload (void endpoints, mapped to `Value::Null`), and an error
    /// carrying the server's structured detail. Anything else is a protocol
    /// error.
    pub fn consume_response(&self, envelope: ServerEnvelope) -> Result<Value> {
        let prefix = self.notice_prefix;
        match envelope {
            ServerEnvelope::RpcResult { call_id, result } if call_id == self.call_id => {
                tracing::debug!(call_id, has_result = result.is_some(), "received call result");
                Ok(result.unwrap_or(Value::Null))
            }
            ServerEnvelope::RpcError { call_id, error } if call_id == self.call_id => {
                Err(ServerError::from_details(format!("{prefix} error"), error).into())
            }
            unmatched => Err(Error::protocol(format!(
                "{prefix} unexpected message: {unmatched:?}"
            ))),
        }
    }
}
