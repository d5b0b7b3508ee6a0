//! Transport enum and backends.
//!
//! A transport is a connected duplex stream of JSON messages. The public
//! API is the [`Transport`] enum; each backend lives in its own module
//! under `transport/`. Establishing the underlying connection (DNS, TLS,
//! handshake bytes) is the backend's concern; the session only needs
//! `send_json`/`recv_json` and a close lifecycle.

use serde_json::Value;

use crate::error::Error;

/// Transport-level failures. Always fatal to the session that owns the
/// transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "websocket")]
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::connection(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    /// Send one JSON message. Concurrent senders are serialized inside the
    /// backend; only one outbound message is in flight at a time.
    pub async fn send_json(&self, message: &Value) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_json(message).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send_json(message).await,
        }
    }

    /// Receive the next JSON message. Only the session's receive loop may
    /// call this; the single-reader invariant is what makes per-queue FIFO
    /// delivery possible.
    pub async fn recv_json(&self) -> Result<Value, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv_json().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv_json().await,
        }
    }

    /// Signal close. Non-blocking; pending reads fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
        }
    }

    /// Connected in-memory pair, for tests and in-process peers.
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Connect a websocket transport to the given URL.
    #[cfg(feature = "websocket")]
    pub async fn websocket(url: &str) -> Result<Self, TransportError> {
        Ok(Transport::WebSocket(
            websocket::WebSocketTransport::connect(url).await?,
        ))
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "websocket")]
pub mod websocket;
