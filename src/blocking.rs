//! Blocking facade over the session core.
//!
//! Every protocol operation is submitted to a [`BackgroundRuntime`] and
//! the calling thread blocks on the returned handle. The multiplexer,
//! channel router, correlator, and endpoint state machines are the exact
//! same code the async facade runs; only the wait primitive differs.
//! Endpoint observer callbacks therefore run on the calling thread, never
//! on the worker.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::BackgroundRuntime;
use crate::endpoint::ChannelEndpoint;
use crate::error::Result;
use crate::session::{Channel, Session};
use crate::transport::{Transport, TransportError};
use crate::wire::AuthRequest;

/// Synchronous session handle driving all I/O through a worker runtime.
pub struct BlockingSession {
    runtime: Arc<BackgroundRuntime>,
    session: Session,
}

impl BlockingSession {
    /// Establish the transport, authenticate, and start the receive loop,
    /// all on the worker runtime. The `transport` future must produce a
    /// connected transport; it runs on the worker, so it must own its data.
    pub fn connect<F>(
        runtime: Arc<BackgroundRuntime>,
        transport: F,
        auth: AuthRequest,
    ) -> Result<Self>
    where
        F: Future<Output = Result<Transport, TransportError>> + Send + 'static,
    {
        let session = runtime.block_on(async move {
            let transport = transport.await?;
            Session::connect(transport, auth).await
        })??;
        Ok(BlockingSession { runtime, session })
    }

    /// The underlying async session handle.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Drop the connection, releasing every blocked caller via the
    /// termination sentinel.
    pub fn disconnect(&self) -> Result<()> {
        let session = self.session.clone();
        self.runtime.block_on(async move { session.disconnect().await })
    }

    /// Make one remote procedure call and block for its single response.
    pub fn remote_call(&self, endpoint: &str, parameter: Option<Value>) -> Result<Value> {
        let session = self.session.clone();
        let endpoint = endpoint.to_string();
        self.runtime
            .block_on(async move { session.remote_call(&endpoint, parameter).await })?
    }

    /// Open a streaming channel; its queue is consumed on the calling
    /// thread.
    pub fn open_channel<E>(&self, endpoint: E) -> Result<BlockingChannel<E>>
    where
        E: ChannelEndpoint + 'static,
    {
        let session = self.session.clone();
        let inner = self
            .runtime
            .block_on(async move { session.open_channel(endpoint).await })??;
        Ok(BlockingChannel {
            runtime: self.runtime.clone(),
            inner,
        })
    }
}

/// Blocking counterpart of [`Channel`].
pub struct BlockingChannel<E: ChannelEndpoint> {
    runtime: Arc<BackgroundRuntime>,
    inner: Channel<E>,
}

impl<E: ChannelEndpoint + 'static> BlockingChannel<E> {
    pub fn endpoint(&self) -> &E {
        self.inner.endpoint()
    }

    pub fn endpoint_mut(&mut self) -> &mut E {
        self.inner.endpoint_mut()
    }

    /// Request cancellation of the channel's operation. Best-effort and a
    /// no-op once the operation has finished.
    pub fn cancel(&mut self) -> Result<()> {
        if self.inner.closed || self.inner.endpoint().is_finished() {
            return Ok(());
        }
        self.inner.endpoint_mut().notify_cancelled();
        let cancel = self.inner.handler.cancel_envelope();
        let session = self.inner.session.clone();
        self.runtime
            .block_on(async move { session.send_envelope(&cancel).await })?
    }

    /// Next raw channel contents, or `None` at end-of-stream. Blocks the
    /// calling thread until the receive loop serves this channel's queue.
    pub fn next_contents(&mut self) -> Result<Option<Value>> {
        if self.inner.closed {
            return Ok(None);
        }
        let item = self.inner.rx.blocking_recv();
        self.inner.accept(item)
    }

    /// Parse the next inbound payload into typed events and apply them to
    /// the endpoint, running callbacks on the calling thread.
    pub fn next_events(&mut self) -> Result<Option<Vec<E::Event>>> {
        if self.inner.endpoint().is_finished() {
            return Ok(None);
        }
        let contents = self.next_contents()?;
        self.inner.events_from_contents(contents)
    }

    /// Drive the channel until the endpoint finishes and return its result.
    pub fn wait_for_result(&mut self) -> Result<E::Output> {
        while self.next_events()?.is_some() {}
        self.inner.handler.endpoint_mut().take_result()
    }
}
