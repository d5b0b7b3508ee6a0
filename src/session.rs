//! Connection session: owns the one physical connection.
//!
//! # Key invariant
//!
//! Only the session's receive loop calls `recv_json()`. Every inbound
//! envelope is routed through the id multiplexer to the private queue of
//! the channel or call that owns it, which is what gives each consumer
//! FIFO delivery without any cross-consumer locking.
//!
//! Termination, whether requested via [`Session::disconnect`] or forced by
//! a transport failure, pushes a `None` sentinel into every registered
//! queue so that no waiter blocks forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ChannelHandler;
use crate::endpoint::ChannelEndpoint;
use crate::error::{Error, Result};
use crate::mux::{ChannelIdGuard, MuxMap, RxReceiver};
use crate::rpc::RemoteCallHandler;
use crate::transport::Transport;
use crate::wire::{AuthRequest, AuthResponse, ClientEnvelope, ServerEnvelope};

pub(crate) struct SessionShared {
    transport: Transport,
    pub(crate) mux: Arc<MuxMap>,
    terminated: AtomicBool,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    /// Mark the session terminated, release every waiter, and drop the
    /// physical connection. Idempotent; called from both `disconnect` and
    /// the receive loop's failure path.
    fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("terminating session");
        for queue in self.mux.all_queues() {
            let _ = queue.send(None);
        }
        self.transport.close();
    }

    async fn receive_loop(self: Arc<Self>) {
        // The loop's cleanup must run even when this task is cancelled
        // (e.g. its runtime shuts down), or blocked consumers would never
        // see the termination sentinel.
        struct ShutdownGuard(Arc<SessionShared>);
        impl Drop for ShutdownGuard {
            fn drop(&mut self) {
                self.0.shutdown();
            }
        }
        let _guard = ShutdownGuard(self.clone());

        loop {
            let raw = match self.transport.recv_json().await {
                Ok(raw) => raw,
                Err(err) => {
                    if !self.terminated.load(Ordering::SeqCst) {
                        tracing::warn!(error = %err, "connection failed, terminating session");
                    }
                    break;
                }
            };
            let envelope: ServerEnvelope = match serde_json::from_value(raw) {
                Ok(envelope) => envelope,
                Err(err) => {
                    // An unparseable message cannot be attributed to any
                    // consumer; the session is no longer coherent.
                    tracing::error!(error = %err, "unrecognized message shape, terminating session");
                    break;
                }
            };
            if let Some(queue) = self.mux.route(&envelope) {
                let _ = queue.send(Some(envelope));
            }
        }
    }
}

/// Cheap-clone handle to one connection session.
///
/// Construct with [`Session::connect`]; callers in the async facade use it
/// directly, blocking callers drive it through
/// [`blocking::BlockingSession`](crate::blocking::BlockingSession).
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Authenticate over a connected transport and start the receive loop.
    ///
    /// Fails with [`Error::Authentication`] if the server rejects the
    /// handshake and [`Error::Connection`] if the transport drops before
    /// authentication completes.
    pub async fn connect(transport: Transport, auth: AuthRequest) -> Result<Self> {
        let auth_message =
            serde_json::to_value(&auth).expect("auth request serializes to JSON");
        transport.send_json(&auth_message).await?;
        let reply = transport.recv_json().await?;
        let reply: AuthResponse = serde_json::from_value(reply)
            .map_err(|err| Error::protocol(format!("malformed authentication reply: {err}")))?;
        if !reply.success {
            return Err(Error::Authentication {
                details: reply.error.unwrap_or(Value::Null),
            });
        }
        tracing::debug!("session authenticated");

        let shared = Arc::new(SessionShared {
            transport,
            mux: MuxMap::new(),
            terminated: AtomicBool::new(false),
            rx_task: Mutex::new(None),
        });
        let rx_task = tokio::spawn(shared.clone().receive_loop());
        *shared.rx_task.lock() = Some(rx_task);
        Ok(Session { shared })
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.terminated.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self, usage: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::connection(format!(
                "session must be connected to {usage}"
            )));
        }
        Ok(())
    }

    /// Drop the connection. Every caller still waiting on a channel or
    /// call receives a termination sentinel rather than hanging.
    pub async fn disconnect(&self) {
        self.shared.shutdown();
        let rx_task = self.shared.rx_task.lock().take();
        if let Some(rx_task) = rx_task {
            let _ = rx_task.await;
        }
        tracing::debug!("session disconnected");
    }

    pub(crate) async fn send_envelope(&self, envelope: &ClientEnvelope) -> Result<()> {
        let message =
            serde_json::to_value(envelope).expect("client envelope serializes to JSON");
        self.shared.transport.send_json(&message).await?;
        Ok(())
    }

    /// Open a streaming channel against the endpoint's operation.
    ///
    /// The channel id registration lives exactly as long as the returned
    /// [`Channel`]; dropping it releases the id even if the channel was
    /// never drained to completion.
    pub async fn open_channel<E: ChannelEndpoint>(&self, endpoint: E) -> Result<Channel<E>> {
        self.ensure_connected("open channel endpoints")?;
        let (queue, rx) = mpsc::unbounded_channel();
        let guard = self.shared.mux.assign_channel_id(queue);
        let handler = ChannelHandler::new(guard.id(), endpoint);
        let creation = handler.creation_envelope();
        tracing::debug!(
            channel_id = guard.id(),
            endpoint = handler.endpoint().api_endpoint(),
            "opening channel"
        );
        self.send_envelope(&creation).await?;
        Ok(Channel {
            handler,
            rx,
            session: self.clone(),
            _guard: guard,
            closed: false,
        })
    }

    /// Make one remote procedure call and await its single response.
    pub async fn remote_call(&self, endpoint: &str, parameter: Option<Value>) -> Result<Value> {
        self.ensure_connected("send remote procedure calls")?;
        let (queue, mut rx) = mpsc::unbounded_channel();
        let guard = self.shared.mux.assign_call_id(queue);
        let rpc = RemoteCallHandler::new(guard.id());
        tracing::debug!(call_id = guard.id(), endpoint, "sending call request");
        self.send_envelope(&rpc.call_envelope(endpoint, parameter))
            .await?;
        match rx.recv().await {
            Some(Some(response)) => rpc.consume_response(response),
            // Sentinel or sender gone: the session terminated under us.
            Some(None) | None => Err(Error::connection(
                "session terminated while awaiting a call response",
            )),
        }
    }
}

/// A logical bidirectional sub-stream nested inside the connection.
///
/// Exclusively owned by the caller that opened it; the multiplexer holds
/// only the queue handle and forgets it when this value drops.
pub struct Channel<E: ChannelEndpoint> {
    pub(crate) handler: ChannelHandler<E>,
    pub(crate) rx: RxReceiver,
    pub(crate) session: Session,
    _guard: ChannelIdGuard,
    /// Router-level end-of-stream (peer sent channelClose).
    pub(crate) closed: bool,
}

impl<E: ChannelEndpoint> Channel<E> {
    pub fn endpoint(&self) -> &E {
        self.handler.endpoint()
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        self.handler.endpoint_mut()
    }

    /// Request cancellation of the channel's operation. Best-effort: the
    /// peer keeps streaming until its own close/success/error arrives, and
    /// the endpoint discards whatever it receives in between. A no-op once
    /// the operation has finished.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.closed || self.handler.endpoint().is_finished() {
            return Ok(());
        }
        tracing::debug!(channel_id = self.handler.channel_id(), "cancelling channel");
        self.handler.endpoint_mut().notify_cancelled();
        let cancel = self.handler.cancel_envelope();
        self.session.send_envelope(&cancel).await
    }

    /// Triage one item taken off the receive queue. Shared by the async
    /// and blocking facades; only the wait primitive differs between them.
    pub(crate) fn accept(
        &mut self,
        item: Option<Option<ServerEnvelope>>,
    ) -> Result<Option<Value>> {
        match item {
            Some(Some(envelope)) => match self.handler.handle_inbound(envelope) {
                Ok(Some(contents)) => Ok(Some(contents)),
                Ok(None) => {
                    self.closed = true;
                    Ok(None)
                }
                Err(err) => {
                    self.closed = true;
                    Err(err)
                }
            },
            Some(None) | None => {
                self.closed = true;
                Err(Error::connection(
                    "session terminated while the channel was active",
                ))
            }
        }
    }

    /// Apply one triaged payload to the endpoint. `None` once the stream
    /// ended; a hangup before the endpoint's terminal event is raised by
    /// the endpoint itself.
    pub(crate) fn events_from_contents(
        &mut self,
        contents: Option<Value>,
    ) -> Result<Option<Vec<E::Event>>> {
        match contents {
            Some(contents) => Ok(Some(
                self.handler.endpoint_mut().handle_message(Some(&contents))?,
            )),
            None => {
                if !self.handler.endpoint().is_finished() {
                    self.handler.endpoint_mut().handle_message(None)?;
                }
                Ok(None)
            }
        }
    }

    /// Next raw channel contents, or `None` at end-of-stream.
    pub async fn next_contents(&mut self) -> Result<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        let item = self.rx.recv().await;
        self.accept(item)
    }

    /// Parse the next inbound payload into typed events and apply them to
    /// the endpoint (running registered callbacks). `None` once the
    /// operation has finished or the stream ended.
    pub async fn next_events(&mut self) -> Result<Option<Vec<E::Event>>> {
        if self.handler.endpoint().is_finished() {
            return Ok(None);
        }
        let contents = self.next_contents().await?;
        self.events_from_contents(contents)
    }

    /// Drive the channel until the endpoint finishes and return its result.
    pub async fn wait_for_result(&mut self) -> Result<E::Output> {
        while self.next_events().await?.is_some() {}
        self.handler.endpoint_mut().take_result()
    }
}
