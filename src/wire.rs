//! Wire envelope vocabulary.
//!
//! Every message on the connection is a JSON object whose `type` field
//! selects the variant. The envelopes are modeled as closed, internally
//! tagged sum types and parsed exactly once at the session boundary;
//! everything downstream matches on the typed variants. A payload that
//! deserializes into no variant is a protocol error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Client → server envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEnvelope {
    /// Open a streaming channel against a named endpoint.
    #[serde(rename_all = "camelCase")]
    ChannelCreate {
        endpoint: String,
        channel_id: u64,
        creation_parameter: Value,
    },
    /// Client-originated data on an open channel (used for cancellation).
    #[serde(rename_all = "camelCase")]
    ChannelSend { channel_id: u64, message: Value },
    /// One-shot remote procedure call.
    #[serde(rename_all = "camelCase")]
    RpcCall {
        endpoint: String,
        call_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        parameter: Option<Value>,
    },
}

/// Server → client envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEnvelope {
    /// Data for an open channel.
    #[serde(rename_all = "camelCase")]
    ChannelSend { channel_id: u64, message: Value },
    /// Orderly end-of-stream for a channel.
    #[serde(rename_all = "camelCase")]
    ChannelClose { channel_id: u64 },
    /// The server failed the channel's operation.
    #[serde(rename_all = "camelCase")]
    ChannelError { channel_id: u64, error: Value },
    /// Successful call response; `result` is absent for void endpoints.
    #[serde(rename_all = "camelCase")]
    RpcResult {
        call_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// The server failed the call.
    #[serde(rename_all = "camelCase")]
    RpcError { call_id: u64, error: Value },
    /// Out-of-band protocol warning. A well-behaved client never triggers
    /// one, so receiving it is logged as an error and never routed.
    CommunicationWarning { warning: Value },
}

impl ServerEnvelope {
    pub fn channel_id(&self) -> Option<u64> {
        match self {
            ServerEnvelope::ChannelSend { channel_id, .. }
            | ServerEnvelope::ChannelClose { channel_id }
            | ServerEnvelope::ChannelError { channel_id, .. } => Some(*channel_id),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<u64> {
        match self {
            ServerEnvelope::RpcResult { call_id, .. }
            | ServerEnvelope::RpcError { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

/// The inner channel message requesting cancellation of the operation.
pub(crate) fn cancel_message() -> Value {
    json!({"type": "cancel"})
}

/// Authentication handshake, sent as the first message on a new connection.
///
/// The identifier/passkey pair is a cooperative client identity rather than
/// an adversarial security measure; it lets the server scope per-client
/// resources and avoid accidental conflicts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub auth_version: u32,
    pub client_identifier: String,
    pub client_passkey: String,
}

impl AuthRequest {
    /// Generate a fresh client identity.
    pub fn generate() -> Self {
        AuthRequest {
            auth_version: 1,
            client_identifier: uuid::Uuid::new_v4().to_string(),
            client_passkey: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// The server's reply to an [`AuthRequest`].
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<Value>,
}
