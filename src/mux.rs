//! Identifier multiplexer: maps every inbound envelope to the consumer that
//! owns it.
//!
//! Two independent registries (one for streaming channels, one for pending
//! calls), each with a strictly increasing id counter scoped to the
//! connection's lifetime. Ids are never reused, even after the owning
//! channel or call is gone; the routing heuristics below rely on that.
//!
//! The registries hold plain queue senders, never owning references to the
//! channel or call objects themselves. Deregistration is tied to guard drop,
//! not to any garbage collection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::wire::ServerEnvelope;

/// Inbound delivery queue. `None` is the termination sentinel pushed when
/// the session shuts down, so no waiter blocks forever.
pub(crate) type RxQueue = mpsc::UnboundedSender<Option<ServerEnvelope>>;
pub(crate) type RxReceiver = mpsc::UnboundedReceiver<Option<ServerEnvelope>>;

#[derive(Default)]
struct MuxState {
    channels: HashMap<u64, RxQueue>,
    calls: HashMap<u64, RxQueue>,
    last_channel_id: u64,
    last_call_id: u64,
}

/// Shared registry of open channels and pending calls.
pub(crate) struct MuxMap {
    state: Mutex<MuxState>,
}

impl MuxMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MuxMap {
            state: Mutex::new(MuxState::default()),
        })
    }

    /// Allocate the next channel id and register `queue` under it. The
    /// registration is removed when the returned guard drops.
    pub(crate) fn assign_channel_id(self: &Arc<Self>, queue: RxQueue) -> ChannelIdGuard {
        let id = {
            let mut state = self.state.lock();
            state.last_channel_id += 1;
            let id = state.last_channel_id;
            state.channels.insert(id, queue.clone());
            id
        };
        tracing::debug!(channel_id = id, "assigned channel id");
        ChannelIdGuard {
            mux: self.clone(),
            queue,
            id,
        }
    }

    /// Allocate the next call id and register `queue` under it.
    pub(crate) fn assign_call_id(self: &Arc<Self>, queue: RxQueue) -> CallIdGuard {
        let id = {
            let mut state = self.state.lock();
            state.last_call_id += 1;
            let id = state.last_call_id;
            state.calls.insert(id, queue.clone());
            id
        };
        tracing::debug!(call_id = id, "assigned call id");
        CallIdGuard {
            mux: self.clone(),
            queue,
            id,
        }
    }

    /// Map an inbound envelope to its registered queue, or `None` when the
    /// envelope has no live consumer.
    ///
    /// An unknown channel id *below* the allocation counter is a harmless
    /// post-close echo and is dropped silently; *at or above* the counter it
    /// is a protocol anomaly worth a warning. A `communicationWarning` is
    /// logged as an error (this client should never trigger one) and is
    /// never routed.
    pub(crate) fn route(&self, envelope: &ServerEnvelope) -> Option<RxQueue> {
        if let ServerEnvelope::CommunicationWarning { warning } = envelope {
            tracing::error!(%warning, "server reported a communication warning");
            return None;
        }
        let state = self.state.lock();
        if let Some(channel_id) = envelope.channel_id() {
            let queue = state.channels.get(&channel_id).cloned();
            if queue.is_none() {
                if channel_id <= state.last_channel_id {
                    tracing::debug!(channel_id, "dropping message for already closed channel");
                } else {
                    tracing::warn!(channel_id, "received message for not yet used channel");
                }
            }
            return queue;
        }
        if let Some(call_id) = envelope.call_id() {
            let queue = state.calls.get(&call_id).cloned();
            if queue.is_none() {
                tracing::warn!(call_id, "received response to unknown call");
            }
            return queue;
        }
        // ServerEnvelope is a closed sum; every variant carries a channel
        // id, a call id, or the warning tag handled above.
        unreachable!("server envelope with no routing tag")
    }

    /// Snapshot of every registered queue, channels first. Used only to
    /// broadcast the termination sentinel.
    pub(crate) fn all_queues(&self) -> Vec<RxQueue> {
        let state = self.state.lock();
        state
            .channels
            .values()
            .chain(state.calls.values())
            .cloned()
            .collect()
    }

    fn release_channel_id(&self, id: u64, queue: &RxQueue) {
        let removed = self.state.lock().channels.remove(&id);
        debug_assert!(
            removed.is_some_and(|q| q.same_channel(queue)),
            "reply queue for channel {id} changed while registered"
        );
    }

    fn release_call_id(&self, id: u64, queue: &RxQueue) {
        let removed = self.state.lock().calls.remove(&id);
        debug_assert!(
            removed.is_some_and(|q| q.same_channel(queue)),
            "reply queue for call {id} changed while registered"
        );
    }
}

/// Scoped channel id registration; deregisters on drop.
pub(crate) struct ChannelIdGuard {
    mux: Arc<MuxMap>,
    queue: RxQueue,
    id: u64,
}

impl ChannelIdGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ChannelIdGuard {
    fn drop(&mut self) {
        self.mux.release_channel_id(self.id, &self.queue);
        tracing::debug!(channel_id = self.id, "released channel id");
    }
}

/// Scoped call id registration; deregisters on drop.
pub(crate) struct CallIdGuard {
    mux: Arc<MuxMap>,
    queue: RxQueue,
    id: u64,
}

impl CallIdGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallIdGuard {
    fn drop(&mut self) {
        self.mux.release_call_id(self.id, &self.queue);
        tracing::debug!(call_id = self.id, "released call id");
    }
}
