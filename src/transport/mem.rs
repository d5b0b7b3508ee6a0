//! In-memory transport: a connected pair of JSON message queues.
//!
//! Used by tests and in-process peers. Each half sends into the other
//! half's receive queue; closing either half fails subsequent operations
//! on both sides once the queues drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::TransportError;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::Sender<Value>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Value>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = MemTransport {
            inner: Arc::new(MemInner {
                tx: tx_b,
                rx: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = MemTransport {
            inner: Arc::new(MemInner {
                tx: tx_a,
                rx: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    pub async fn send_json(&self, message: &Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(message.clone())
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv_json(&self) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
