//! Artifact download endpoint: `downloadModel`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::endpoint::{invoke_callback, ChannelEndpoint};
use crate::error::{Error, Result, ServerError};

pub type DownloadProgressCallback = Box<dyn FnMut(&DownloadProgress) + Send>;
pub type DownloadFinalizeCallback = Box<dyn FnMut() + Send>;

/// A download progress update from the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_second: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    /// The transfer is complete and the server is finalizing the artifact.
    Finalizing,
    Finished,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum DownloadChannelMessage {
    DownloadProgress {
        update: DownloadProgress,
    },
    StartFinalizing,
    #[serde(rename_all = "camelCase")]
    Success {
        default_identifier: String,
    },
}

/// Channel state machine for downloading an available model artifact.
///
/// The result is the default identifier under which the downloaded model
/// can subsequently be loaded.
pub struct DownloadEndpoint {
    download_identifier: String,
    creation_params: Value,
    finished: bool,
    result: Option<String>,
    on_progress: Option<DownloadProgressCallback>,
    on_finalize: Option<DownloadFinalizeCallback>,
}

impl DownloadEndpoint {
    pub fn new(download_identifier: impl Into<String>) -> Self {
        let download_identifier = download_identifier.into();
        let creation_params = json!({"downloadIdentifier": download_identifier});
        DownloadEndpoint {
            download_identifier,
            creation_params,
            finished: false,
            result: None,
            on_progress: None,
            on_finalize: None,
        }
    }

    pub fn on_progress(
        mut self,
        callback: impl FnMut(&DownloadProgress) + Send + 'static,
    ) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub fn on_finalize(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_finalize = Some(Box::new(callback));
        self
    }
}

impl ChannelEndpoint for DownloadEndpoint {
    type Event = DownloadEvent;
    type Output = String;

    fn api_endpoint(&self) -> &'static str {
        "downloadModel"
    }

    fn notice_prefix(&self) -> &'static str {
        "Model download"
    }

    fn creation_params(&self) -> &Value {
        &self.creation_params
    }

    fn message_events(&mut self, contents: Option<&Value>) -> Result<Vec<DownloadEvent>> {
        if self.finished {
            return Err(Error::protocol(
                "Model download received an update for a completed channel",
            ));
        }
        let Some(contents) = contents else {
            return Err(
                ServerError::channel_closed("Server failed to complete model download.").into(),
            );
        };
        let message: DownloadChannelMessage =
            serde_json::from_value(contents.clone()).map_err(|_| {
                Error::protocol(format!(
                    "Model download unexpected message contents: {contents}"
                ))
            })?;
        let events = match message {
            DownloadChannelMessage::DownloadProgress { update } => {
                vec![DownloadEvent::Progress(update)]
            }
            DownloadChannelMessage::StartFinalizing => vec![DownloadEvent::Finalizing],
            DownloadChannelMessage::Success { default_identifier } => {
                self.finished = true;
                self.result = Some(default_identifier);
                vec![DownloadEvent::Finished]
            }
        };
        Ok(events)
    }

    fn handle_event(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Progress(update) => {
                if let Some(callback) = self.on_progress.as_mut() {
                    invoke_callback("Model download", "download progress", || callback(update));
                }
            }
            DownloadEvent::Finalizing => {
                tracing::debug!(
                    download_identifier = %self.download_identifier,
                    "server started finalizing the download"
                );
                if let Some(callback) = self.on_finalize.as_mut() {
                    invoke_callback("Model download", "finalize", || callback());
                }
            }
            DownloadEvent::Finished => {}
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> Result<String> {
        if !self.finished {
            return Err(Error::usage(
                "Model download result read from an active channel",
            ));
        }
        self.result
            .take()
            .ok_or_else(|| Error::usage("Model download result has already been taken"))
    }
}
