//! Model loading endpoints: `loadModel` and `getOrLoad`.
//!
//! Both share the same message vocabulary and progress rules and differ
//! only in endpoint name and creation parameters, so the state machine
//! lives in one shared core.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::endpoint::{invoke_callback, ChannelEndpoint, ProgressTracker};
use crate::error::{Error, Result, ServerError};

pub type LoadProgressCallback = Box<dyn FnMut(f64) + Send>;

/// Details of a loaded model instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLoadResult {
    pub identifier: String,
    pub instance_reference: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelLoadEvent {
    /// Strictly increasing load progress in `0.0..=1.0`.
    Progress(f64),
    Finished,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum LoadChannelMessage {
    Resolved {
        #[serde(default)]
        ambiguous: Option<Value>,
    },
    StartLoading,
    #[serde(alias = "progress")]
    LoadProgress { progress: f64 },
    #[serde(rename = "unloadingOtherJITModel")]
    UnloadingOtherJitModel {
        #[serde(default)]
        info: Value,
    },
    #[serde(alias = "alreadyLoaded", alias = "loadSuccess")]
    Success { info: ModelLoadResult },
}

struct ModelLoadingState {
    model_key: String,
    creation_params: Value,
    on_progress: Option<LoadProgressCallback>,
    progress: ProgressTracker,
    finished: bool,
    result: Option<ModelLoadResult>,
}

impl ModelLoadingState {
    fn new(model_key: String, creation_params: Value) -> Self {
        ModelLoadingState {
            model_key,
            creation_params,
            on_progress: None,
            progress: ProgressTracker::new(),
            finished: false,
            result: None,
        }
    }

    fn push_progress(&mut self, progress: f64, events: &mut Vec<ModelLoadEvent>) {
        if let Some(progress) = self.progress.update(progress) {
            events.push(ModelLoadEvent::Progress(progress));
        }
    }

    fn message_events(
        &mut self,
        notice_prefix: &str,
        contents: Option<&Value>,
    ) -> Result<Vec<ModelLoadEvent>> {
        if self.finished {
            return Err(Error::protocol(format!(
                "{notice_prefix} received an update for a completed channel"
            )));
        }
        let Some(contents) = contents else {
            return Err(ServerError::channel_closed("Server failed to load requested model.").into());
        };
        let message: LoadChannelMessage =
            serde_json::from_value(contents.clone()).map_err(|_| {
                Error::protocol(format!(
                    "{notice_prefix} unexpected message contents: {contents}"
                ))
            })?;
        let mut events = Vec::new();
        match message {
            LoadChannelMessage::Resolved { ambiguous } => {
                if let Some(ambiguous) = ambiguous {
                    tracing::warn!(model_key = %self.model_key, %ambiguous, "ambiguous model load request");
                }
            }
            LoadChannelMessage::StartLoading => {
                tracing::debug!(model_key = %self.model_key, "model loading started");
                self.push_progress(0.0, &mut events);
            }
            LoadChannelMessage::LoadProgress { progress } => {
                self.push_progress(progress, &mut events);
            }
            LoadChannelMessage::UnloadingOtherJitModel { info } => {
                tracing::info!(
                    unloaded_model_key = info.get("modelKey").and_then(|v| v.as_str()),
                    "unloading another just-in-time model to free resources"
                );
            }
            LoadChannelMessage::Success { info } => {
                if self.progress.last() < 1.0 {
                    self.push_progress(1.0, &mut events);
                }
                self.finished = true;
                self.result = Some(info);
                events.push(ModelLoadEvent::Finished);
            }
        }
        Ok(events)
    }

    fn handle_event(&mut self, notice_prefix: &str, event: &ModelLoadEvent) {
        match event {
            ModelLoadEvent::Progress(progress) => {
                if let Some(callback) = self.on_progress.as_mut() {
                    invoke_callback(notice_prefix, "load progress", || callback(*progress));
                }
            }
            ModelLoadEvent::Finished => {}
        }
    }

    fn take_result(&mut self, notice_prefix: &str) -> Result<ModelLoadResult> {
        if !self.finished {
            return Err(Error::usage(format!(
                "{notice_prefix} result read from an active channel"
            )));
        }
        self.result.take().ok_or_else(|| {
            Error::usage(format!("{notice_prefix} result has already been taken"))
        })
    }
}

/// Loads a new instance of a downloaded model.
pub struct LoadModelEndpoint {
    state: ModelLoadingState,
}

impl LoadModelEndpoint {
    pub fn new(
        model_key: impl Into<String>,
        instance_identifier: Option<String>,
        ttl: Option<Duration>,
        load_config: Value,
    ) -> Self {
        let model_key = model_key.into();
        let mut params = json!({
            "modelKey": model_key,
            "loadConfigStack": load_config,
        });
        if let Some(identifier) = instance_identifier {
            params["identifier"] = Value::String(identifier);
        }
        if let Some(ttl) = ttl {
            params["ttlMs"] = json!(ttl.as_millis() as u64);
        }
        LoadModelEndpoint {
            state: ModelLoadingState::new(model_key, params),
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(f64) + Send + 'static) -> Self {
        self.state.on_progress = Some(Box::new(callback));
        self
    }
}

impl ChannelEndpoint for LoadModelEndpoint {
    type Event = ModelLoadEvent;
    type Output = ModelLoadResult;

    fn api_endpoint(&self) -> &'static str {
        "loadModel"
    }

    fn notice_prefix(&self) -> &'static str {
        "Model load"
    }

    fn creation_params(&self) -> &Value {
        &self.state.creation_params
    }

    fn message_events(&mut self, contents: Option<&Value>) -> Result<Vec<ModelLoadEvent>> {
        self.state.message_events(self.notice_prefix(), contents)
    }

    fn handle_event(&mut self, event: &ModelLoadEvent) {
        self.state.handle_event(self.notice_prefix(), event);
    }

    fn is_finished(&self) -> bool {
        self.state.finished
    }

    fn take_result(&mut self) -> Result<ModelLoadResult> {
        self.state.take_result(self.notice_prefix())
    }
}

/// Returns an already loaded model, loading it first if necessary.
pub struct GetOrLoadEndpoint {
    state: ModelLoadingState,
}

impl GetOrLoadEndpoint {
    pub fn new(model_key: impl Into<String>, ttl: Option<Duration>, load_config: Value) -> Self {
        let model_key = model_key.into();
        let mut params = json!({
            "identifier": model_key,
            "loadConfigStack": load_config,
        });
        if let Some(ttl) = ttl {
            params["loadTtlMs"] = json!(ttl.as_millis() as u64);
        }
        GetOrLoadEndpoint {
            state: ModelLoadingState::new(model_key, params),
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(f64) + Send + 'static) -> Self {
        self.state.on_progress = Some(Box::new(callback));
        self
    }
}

impl ChannelEndpoint for GetOrLoadEndpoint {
    type Event = ModelLoadEvent;
    type Output = ModelLoadResult;

    fn api_endpoint(&self) -> &'static str {
        "getOrLoad"
    }

    fn notice_prefix(&self) -> &'static str {
        "Model get/load"
    }

    fn creation_params(&self) -> &Value {
        &self.state.creation_params
    }

    fn message_events(&mut self, contents: Option<&Value>) -> Result<Vec<ModelLoadEvent>> {
        self.state.message_events(self.notice_prefix(), contents)
    }

    fn handle_event(&mut self, event: &ModelLoadEvent) {
        self.state.handle_event(self.notice_prefix(), event);
    }

    fn is_finished(&self) -> bool {
        self.state.finished
    }

    fn take_result(&mut self) -> Result<ModelLoadResult> {
        self.state.take_result(self.notice_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerErrorKind;
    use std::sync::{Arc, Mutex};

    fn success_contents() -> Value {
        json!({
            "type": "success",
            "info": {
                "identifier": "qwen2.5-7b",
                "instanceReference": "ref-1",
                "path": "models/qwen2.5-7b.gguf",
            },
        })
    }

    #[test]
    fn progress_events_are_strictly_increasing() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        let mut emitted = Vec::new();
        for progress in [0.2, 0.2, 0.1, 0.5] {
            let events = endpoint
                .handle_message(Some(&json!({"type": "loadProgress", "progress": progress})))
                .unwrap();
            for event in events {
                if let ModelLoadEvent::Progress(p) = event {
                    emitted.push(p);
                }
            }
        }
        assert_eq!(emitted, vec![0.2, 0.5]);
    }

    #[test]
    fn success_synthesizes_final_progress_and_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut endpoint = GetOrLoadEndpoint::new("m", Some(Duration::from_secs(60)), json!({}))
            .on_progress(move |p| sink.lock().unwrap().push(p));
        assert_eq!(endpoint.creation_params()["loadTtlMs"], json!(60_000));

        endpoint
            .handle_message(Some(&json!({"type": "startLoading"})))
            .unwrap();
        endpoint
            .handle_message(Some(&json!({"type": "progress", "progress": 0.5})))
            .unwrap();
        let events = endpoint.handle_message(Some(&success_contents())).unwrap();
        assert!(events.contains(&ModelLoadEvent::Finished));
        assert!(endpoint.is_finished());
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0]);

        let result = endpoint.take_result().unwrap();
        assert_eq!(result.identifier, "qwen2.5-7b");
        assert_eq!(result.instance_reference, "ref-1");
    }

    #[test]
    fn already_loaded_counts_as_success() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        let contents = json!({
            "type": "alreadyLoaded",
            "info": {"identifier": "m", "instanceReference": "r", "path": "p"},
        });
        endpoint.handle_message(Some(&contents)).unwrap();
        assert!(endpoint.is_finished());
    }

    #[test]
    fn result_before_finish_is_a_usage_error() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        assert!(matches!(endpoint.take_result(), Err(Error::Usage { .. })));
    }

    #[test]
    fn early_close_is_a_channel_closed_error() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        match endpoint.handle_message(None) {
            Err(Error::Server(err)) => assert_eq!(err.kind, ServerErrorKind::ChannelClosed),
            other => panic!("expected channel closed error, got {other:?}"),
        }
    }

    #[test]
    fn update_after_completion_is_a_protocol_error() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        endpoint.handle_message(Some(&success_contents())).unwrap();
        let stray = endpoint.handle_message(Some(&json!({"type": "loadProgress", "progress": 1.0})));
        assert!(matches!(stray, Err(Error::Protocol { .. })));
    }

    #[test]
    fn unknown_contents_are_a_protocol_error() {
        let mut endpoint = LoadModelEndpoint::new("m", None, None, json!({}));
        let stray = endpoint.handle_message(Some(&json!({"type": "confetti"})));
        assert!(matches!(stray, Err(Error::Protocol { .. })));
    }
}
