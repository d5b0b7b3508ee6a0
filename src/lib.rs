//! sluice: a multiplexed streaming/RPC client engine for model inference servers.
//!
//! Many independent logical operations, one-shot remote calls and long-lived
//! streaming channels alike, share a single persistent connection. The key
//! invariant is that only the session's receive loop reads from the
//! transport; every inbound envelope is routed through the id multiplexer to
//! the private queue of the channel or call that owns it.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────┐
//!                    │             Session             │
//!                    ├─────────────────────────────────┤
//!                    │  transport: Transport           │
//!                    │  mux: channel_id → queue        │
//!                    │       call_id    → queue        │
//!                    └───────────┬─────────────────────┘
//!                                │
//!                          receive loop
//!                                │
//!          ┌─────────────────────┼─────────────────────┐
//!          │                     │                     │
//!    channel id?             call id?          communicationWarning?
//!          │                     │                     │
//!   ┌──────▼───────┐   ┌─────────▼────────┐   ┌────────▼────────┐
//!   │ Channel queue│   │ Pending call     │   │ log as error,   │
//!   │ → endpoint   │   │ queue → correlator│  │ never routed    │
//!   │ state machine│   └──────────────────┘   └─────────────────┘
//!   └──────────────┘
//! ```
//!
//! # Facades
//!
//! Two caller concurrency models run over the same session core:
//!
//! - **Async**: [`Session`] runs inside the caller's tokio runtime.
//!   `open_channel`/`remote_call` suspend the calling task until its queue
//!   is served.
//! - **Blocking**: [`blocking::BlockingSession`] drives all I/O through a
//!   [`bridge::BackgroundRuntime`], a dedicated worker thread owning one
//!   current-thread runtime, while queue consumption blocks the calling
//!   thread directly.
//!
//! # Usage
//!
//! ```ignore
//! let transport = Transport::websocket("ws://localhost:1234/llm").await?;
//! let session = Session::connect(transport, AuthRequest::generate()).await?;
//!
//! // One-shot call
//! let models = session.remote_call("listLoaded", None).await?;
//!
//! // Streaming channel
//! let endpoint = PredictionEndpoint::new(request, false)
//!     .on_fragment(|fragment| print!("{}", fragment.content));
//! let mut channel = session.open_channel(endpoint).await?;
//! let result = channel.wait_for_result().await?;
//! ```

#![forbid(unsafe_code)]

pub mod blocking;
pub mod bridge;
mod channel;
mod endpoint;
mod error;
mod mux;
mod rpc;
mod session;
mod transport;
mod wire;

pub use channel::ChannelHandler;
pub use endpoint::{
    invoke_callback, ChannelEndpoint, DownloadEndpoint, DownloadEvent, DownloadFinalizeCallback,
    DownloadProgress, DownloadProgressCallback, FirstTokenCallback, FragmentCallback,
    FragmentReasoningType, GetOrLoadEndpoint, LoadModelEndpoint, LoadProgressCallback,
    ModelLoadEvent, ModelLoadResult, PredictionEndpoint, PredictionEvent, PredictionFragment,
    PredictionRequest, PredictionResult, PromptProgressCallback, ToolCallRequest,
};
pub use error::{Error, ErrorDetail, Result, ServerError, ServerErrorKind};
pub use rpc::RemoteCallHandler;
pub use session::{Channel, Session};
pub use transport::{Transport, TransportError};
pub use wire::{AuthRequest, AuthResponse, ClientEnvelope, ServerEnvelope};
