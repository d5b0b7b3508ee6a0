//! WebSocket transport backend over tokio-tungstenite.
//!
//! The socket is split into sink and stream halves owned by two relay
//! tasks; callers talk to them over bounded queues. The relay tasks are
//! what serialize concurrent senders into one outbound message at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::TransportError;

const CHANNEL_CAPACITY: usize = 64;

enum OutMsg {
    Text(String),
    Close,
}

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WebSocketInner>,
}

struct WebSocketInner {
    send: mpsc::Sender<OutMsg>,
    recv: AsyncMutex<mpsc::Receiver<String>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Connect to the given websocket URL.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self::new(ws))
    }

    /// Wrap an already established websocket stream.
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (send_tx, mut send_rx) = mpsc::channel::<OutMsg>(CHANNEL_CAPACITY);
        let (recv_tx, recv_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let inner = Arc::new(WebSocketInner {
            send: send_tx,
            recv: AsyncMutex::new(recv_rx),
            closed: AtomicBool::new(false),
        });

        let (mut sink, mut stream) = ws.split();

        let inner_for_writer = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = send_rx.recv().await {
                match msg {
                    OutMsg::Text(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            inner_for_writer.closed.store(true, Ordering::Release);
                            break;
                        }
                    }
                    OutMsg::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        inner_for_writer.closed.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        });

        let inner_for_reader = inner.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if recv_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        inner_for_reader.closed.store(true, Ordering::Release);
                        break;
                    }
                    Ok(Message::Binary(_))
                    | Ok(Message::Ping(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Frame(_)) => {}
                    Err(_) => {
                        inner_for_reader.closed.store(true, Ordering::Release);
                        break;
                    }
                }
            }
        });

        WebSocketTransport { inner }
    }

    /// Connected websocket pair over an in-process duplex stream, for
    /// exercising the real framing in tests.
    pub async fn pair() -> (Self, Self) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

        let client_fut = tokio_tungstenite::client_async("ws://localhost/", client_stream);
        let server_fut = tokio_tungstenite::accept_async(server_stream);
        let (client_result, server_result) = futures::future::join(client_fut, server_fut).await;

        let ws_client = client_result.expect("client handshake failed").0;
        let ws_server = server_result.expect("server handshake failed");
        (Self::new(ws_client), Self::new(ws_server))
    }

    pub async fn send_json(&self, message: &Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(message)?;
        self.inner
            .send
            .send(OutMsg::Text(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv_json(&self) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = {
            let mut recv = self.inner.recv.lock().await;
            recv.recv().await.ok_or(TransportError::Closed)?
        };
        Ok(serde_json::from_str(&text)?)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.send.try_send(OutMsg::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
