//! Channel endpoint state machines.
//!
//! An endpoint interprets the raw messages of one streaming channel as
//! typed events, accumulates per-operation state, and exposes a final
//! result once the terminal event arrives. Endpoints are pure protocol
//! logic: the same state machine is driven by the async and blocking
//! facades alike.

mod download;
mod load;
mod predict;

pub use download::{
    DownloadEndpoint, DownloadEvent, DownloadFinalizeCallback, DownloadProgress,
    DownloadProgressCallback,
};
pub use load::{
    GetOrLoadEndpoint, LoadModelEndpoint, LoadProgressCallback, ModelLoadEvent, ModelLoadResult,
};
pub use predict::{
    FirstTokenCallback, FragmentCallback, FragmentReasoningType, PredictionEndpoint,
    PredictionEvent, PredictionFragment, PredictionRequest, PredictionResult,
    PromptProgressCallback, ToolCallRequest,
};

use serde_json::Value;

use crate::error::Result;

/// Per-operation-kind channel logic.
///
/// `message_events` is a pure translation from one inbound payload to
/// zero-or-more events; it is called once per inbound item and must fail on
/// `None` contents (the peer hung up mid-operation) unless the operation
/// legitimately allows it. `handle_event` applies an event to local state
/// and invokes any registered observer callback; callback failures are
/// isolated and never corrupt the state machine.
pub trait ChannelEndpoint: Send {
    type Event;
    type Output;

    /// Remote endpoint name this channel is created against.
    fn api_endpoint(&self) -> &'static str;

    /// Prefix for log and error messages about this operation.
    fn notice_prefix(&self) -> &'static str;

    /// Creation parameters, immutable once constructed.
    fn creation_params(&self) -> &Value;

    /// Translate one inbound payload into typed events. `None` contents
    /// signal the peer closed the channel without a terminal event.
    fn message_events(&mut self, contents: Option<&Value>) -> Result<Vec<Self::Event>>;

    /// Apply one event to local state and run registered callbacks.
    fn handle_event(&mut self, event: &Self::Event);

    fn is_finished(&self) -> bool;

    /// Read the final result. Fails with a usage error before
    /// [`is_finished`](Self::is_finished) reports true.
    fn take_result(&mut self) -> Result<Self::Output>;

    /// The owning channel was asked to cancel; subsequent data events are
    /// discarded rather than raised. Default: no-op for endpoints without
    /// cancellation semantics.
    fn notify_cancelled(&mut self) {}

    /// Translate and apply all events for one inbound payload.
    fn handle_message(&mut self, contents: Option<&Value>) -> Result<Vec<Self::Event>> {
        let events = self.message_events(contents)?;
        for event in &events {
            self.handle_event(event);
        }
        Ok(events)
    }
}

/// Run an observer callback, containing any panic it raises.
///
/// Callback failures are logged and must never unwind into the protocol
/// handling code that invoked them.
pub fn invoke_callback<F: FnOnce()>(notice_prefix: &str, what: &str, callback: F) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
    if let Err(panic) = outcome {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        tracing::error!(
            endpoint = notice_prefix,
            callback = what,
            %reason,
            "observer callback failed"
        );
    }
}

/// Tracks the last emitted value of a progress stream.
///
/// Progress events are emitted only for strictly increasing values; a peer
/// re-sending a stale value or a duplicate must not re-notify observers.
pub(crate) struct ProgressTracker {
    last: f64,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        ProgressTracker { last: -1.0 }
    }

    pub(crate) fn last(&self) -> f64 {
        self.last
    }

    /// `Some(progress)` when the value advances, `None` otherwise.
    pub(crate) fn update(&mut self, progress: f64) -> Option<f64> {
        if progress <= self.last {
            return None;
        }
        self.last = progress;
        Some(progress)
    }
}
