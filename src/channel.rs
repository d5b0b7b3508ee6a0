//! Per-channel envelope routing.
//!
//! A [`ChannelHandler`] wraps one endpoint state machine with the generic
//! channel framing: it builds the creation and cancellation envelopes and
//! unwraps inbound envelopes into the endpoint's raw message contents.

use serde_json::Value;

use crate::endpoint::ChannelEndpoint;
use crate::error::{Error, Result, ServerError};
use crate::wire::{cancel_message, ClientEnvelope, ServerEnvelope};

/// Bidirectional subchannel message handling for one endpoint.
pub struct ChannelHandler<E> {
    channel_id: u64,
    endpoint: E,
}

impl<E: ChannelEndpoint> ChannelHandler<E> {
    pub fn new(channel_id: u64, endpoint: E) -> Self {
        ChannelHandler {
            channel_id,
            endpoint,
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// The envelope that opens this channel against its endpoint.
    pub fn creation_envelope(&self) -> ClientEnvelope {
        ClientEnvelope::ChannelCreate {
            endpoint: self.endpoint.api_endpoint().to_string(),
            channel_id: self.channel_id,
            creation_parameter: self.endpoint.creation_params().clone(),
        }
    }

    /// The envelope requesting cancellation of this channel's operation.
    ///
    /// Only meaningful while the channel is unfinished; the facades skip the
    /// send entirely once the endpoint has finished.
    pub fn cancel_envelope(&self) -> ClientEnvelope {
        ClientEnvelope::ChannelSend {
            channel_id: self.channel_id,
            message: cancel_message(),
        }
    }

    /// Unwrap one inbound envelope for this channel.
    ///
    /// `channelSend` yields the inner contents, `channelClose` yields `None`
    /// (end of stream), `channelError` raises the server's failure. Any
    /// other envelope tagged with this channel id is a protocol error.
    pub fn handle_inbound(&self, envelope: ServerEnvelope) -> Result<Option<Value>> {
        let prefix = self.endpoint.notice_prefix();
        match envelope {
            ServerEnvelope::ChannelSend {
                channel_id,
                message,
            } if channel_id == self.channel_id => Ok(Some(message)),
            ServerEnvelope::ChannelClose { channel_id } if channel_id == self.channel_id => {
                tracing::debug!(channel_id, "channel closed by server");
                Ok(None)
            }
            ServerEnvelope::ChannelError { channel_id, error } if channel_id == self.channel_id => {
                Err(ServerError::from_details(format!("{prefix} error"), error).into())
            }
            unmatched => Err(Error::protocol(format!(
                "{prefix} unexpected message: {unmatched:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{GetOrLoadEndpoint, LoadModelEndpoint};
    use serde_json::json;

    #[test]
    fn creation_envelope_round_trips_creation_params() {
        let endpoint = LoadModelEndpoint::new("qwen2.5-7b", None, None, json!({"gpu": "auto"}));
        let params = endpoint.creation_params().clone();
        let handler = ChannelHandler::new(4, endpoint);

        let envelope = handler.creation_envelope();
        let encoded = serde_json::to_value(&envelope).unwrap();
        let decoded: ClientEnvelope = serde_json::from_value(encoded).unwrap();
        match decoded {
            ClientEnvelope::ChannelCreate {
                endpoint,
                channel_id,
                creation_parameter,
            } => {
                assert_eq!(endpoint, "loadModel");
                assert_eq!(channel_id, 4);
                assert_eq!(creation_parameter, params);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn inbound_send_close_and_error_are_triaged() {
        let handler =
            ChannelHandler::new(2, GetOrLoadEndpoint::new("embed-model", None, json!({})));

        let contents = handler
            .handle_inbound(ServerEnvelope::ChannelSend {
                channel_id: 2,
                message: json!({"type": "startLoading"}),
            })
            .unwrap();
        assert_eq!(contents, Some(json!({"type": "startLoading"})));

        let end = handler
            .handle_inbound(ServerEnvelope::ChannelClose { channel_id: 2 })
            .unwrap();
        assert_eq!(end, None);

        let err = handler.handle_inbound(ServerEnvelope::ChannelError {
            channel_id: 2,
            error: json!({"title": "no such model"}),
        });
        assert!(matches!(err, Err(Error::Server(_))));

        let stray = handler.handle_inbound(ServerEnvelope::RpcResult {
            call_id: 2,
            result: None,
        });
        assert!(matches!(stray, Err(Error::Protocol { .. })));
    }
}
