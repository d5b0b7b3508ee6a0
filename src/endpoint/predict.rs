//! Streaming prediction endpoint.
//!
//! Accumulates fragment text into the final content, tracks prompt
//! processing progress, surfaces tool call generation, and supports
//! best-effort cancellation: once cancelled, further fragments and progress
//! updates are discarded rather than raised, because a race between the
//! cancel request and in-flight fragments is expected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::{invoke_callback, ChannelEndpoint};
use crate::error::{Error, Result, ServerError, ServerErrorKind};

pub type FirstTokenCallback = Box<dyn FnMut() + Send>;
pub type FragmentCallback = Box<dyn FnMut(&PredictionFragment) + Send>;
pub type PromptProgressCallback = Box<dyn FnMut(f64) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FragmentReasoningType {
    #[default]
    None,
    Reasoning,
    ReasoningStartTag,
    ReasoningEndTag,
}

/// One streamed piece of predicted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionFragment {
    pub content: String,
    #[serde(default)]
    pub tokens_count: u64,
    #[serde(default)]
    pub contains_drafted: bool,
    #[serde(default)]
    pub reasoning_type: FragmentReasoningType,
}

/// A tool invocation the model asked the client to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredictionEvent {
    /// Strictly increasing prompt processing progress in `0.0..=1.0`.
    PrepProgress(f64),
    Fragment(PredictionFragment),
    ToolCall(ToolCallRequest),
    /// The server failed to generate a parseable tool call request.
    ToolCallAborted,
    Finished,
}

/// The final result of a prediction.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    /// Concatenated text of every received fragment.
    pub content: String,
    /// Parsed JSON object for structured predictions, the raw text otherwise.
    pub parsed: Value,
    /// Whether `parsed` holds decoded structured data rather than raw text.
    pub structured: bool,
    pub stats: Value,
    pub model_info: Value,
    pub load_config: Value,
    pub prediction_config: Value,
}

/// Creation parameters for a prediction channel.
///
/// The payload schemas are owned by the domain layer; this engine only
/// routes them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRequest {
    pub model_specifier: Value,
    pub history: Value,
    pub prediction_config_stack: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuzzy_preset_identifier: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum PredictionChannelMessage {
    Fragment {
        fragment: PredictionFragment,
    },
    PromptProcessingProgress {
        progress: f64,
    },
    ToolCallGenerationStart,
    #[serde(rename_all = "camelCase")]
    ToolCallGenerationEnd {
        tool_call_request: ToolCallRequest,
    },
    ToolCallGenerationFailed,
    Error {
        error: Value,
    },
    #[serde(rename_all = "camelCase")]
    Success {
        #[serde(default)]
        stats: Value,
        #[serde(default)]
        model_info: Value,
        #[serde(default)]
        load_model_config: Value,
        #[serde(default)]
        prediction_config: Value,
    },
}

/// Channel state machine for the `predict` endpoint.
pub struct PredictionEndpoint {
    creation_params: Value,
    structured: bool,
    cancelled: bool,
    finished: bool,
    result: Option<PredictionResult>,
    fragment_content: String,
    /// Last emitted prompt processing progress; -1.0 before the first event.
    prep_progress: f64,
    pending_tool_calls: Vec<ToolCallRequest>,
    on_first_token: Option<FirstTokenCallback>,
    on_fragment: Option<FragmentCallback>,
    on_prompt_progress: Option<PromptProgressCallback>,
}

impl PredictionEndpoint {
    /// `structured` records whether the caller requested a structured
    /// response; it controls result decoding, not the wire payload.
    pub fn new(request: PredictionRequest, structured: bool) -> Self {
        let creation_params =
            serde_json::to_value(&request).expect("prediction request serializes to JSON");
        PredictionEndpoint {
            creation_params,
            structured,
            cancelled: false,
            finished: false,
            result: None,
            fragment_content: String::new(),
            prep_progress: -1.0,
            pending_tool_calls: Vec::new(),
            on_first_token: None,
            on_fragment: None,
            on_prompt_progress: None,
        }
    }

    /// Fires once, on the first content fragment only.
    pub fn on_first_token(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_first_token = Some(Box::new(callback));
        self
    }

    pub fn on_fragment(
        mut self,
        callback: impl FnMut(&PredictionFragment) + Send + 'static,
    ) -> Self {
        self.on_fragment = Some(Box::new(callback));
        self
    }

    pub fn on_prompt_processing_progress(
        mut self,
        callback: impl FnMut(f64) + Send + 'static,
    ) -> Self {
        self.on_prompt_progress = Some(Box::new(callback));
        self
    }

    /// Tool call requests received so far; drained by the domain layer.
    pub fn pending_tool_calls(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.pending_tool_calls)
    }

    fn push_prep_progress(&mut self, progress: f64, events: &mut Vec<PredictionEvent>) {
        let last = self.prep_progress;
        if progress <= last {
            return;
        }
        self.prep_progress = progress;
        if last < 0.0 && progress > 0.0 {
            // The first observed progress gets a leading 0.0 event so
            // observers always see the start of prompt processing.
            events.push(PredictionEvent::PrepProgress(0.0));
        }
        events.push(PredictionEvent::PrepProgress(progress));
    }

    fn finish(&mut self, message: SuccessPayload, events: &mut Vec<PredictionEvent>) {
        let content = std::mem::take(&mut self.fragment_content);
        // A cancelled prediction may have stopped mid-output; never try to
        // decode partial content as structured data.
        let (parsed, structured) = if self.structured && !self.cancelled {
            match serde_json::from_str::<Value>(&content) {
                // Grammar-constrained output is not necessarily JSON; fall
                // back to the raw text rather than failing the prediction.
                Ok(value @ Value::Object(_)) => (value, true),
                _ => (Value::String(content.clone()), false),
            }
        } else {
            (Value::String(content.clone()), false)
        };
        self.finished = true;
        self.result = Some(PredictionResult {
            content,
            parsed,
            structured,
            stats: message.stats,
            model_info: message.model_info,
            load_config: message.load_model_config,
            prediction_config: message.prediction_config,
        });
        events.push(PredictionEvent::Finished);
    }
}

struct SuccessPayload {
    stats: Value,
    model_info: Value,
    load_model_config: Value,
    prediction_config: Value,
}

impl ChannelEndpoint for PredictionEndpoint {
    type Event = PredictionEvent;
    type Output = PredictionResult;

    fn api_endpoint(&self) -> &'static str {
        "predict"
    }

    fn notice_prefix(&self) -> &'static str {
        "Prediction"
    }

    fn creation_params(&self) -> &Value {
        &self.creation_params
    }

    fn message_events(&mut self, contents: Option<&Value>) -> Result<Vec<PredictionEvent>> {
        if self.finished {
            return Err(Error::protocol(
                "Prediction received an update for a completed channel",
            ));
        }
        let Some(contents) = contents else {
            return Err(
                ServerError::channel_closed("Server failed to complete prediction.").into(),
            );
        };
        let message: PredictionChannelMessage =
            serde_json::from_value(contents.clone()).map_err(|_| {
                Error::protocol(format!("Prediction unexpected message contents: {contents}"))
            })?;
        let mut events = Vec::new();
        match message {
            PredictionChannelMessage::Fragment { fragment } => {
                if self.cancelled {
                    return Ok(events);
                }
                // The server only emits tokens once prompt processing is
                // done, but may skip sending the completion event itself.
                self.push_prep_progress(1.0, &mut events);
                self.fragment_content.push_str(&fragment.content);
                events.push(PredictionEvent::Fragment(fragment));
            }
            PredictionChannelMessage::PromptProcessingProgress { progress } => {
                if self.cancelled {
                    return Ok(events);
                }
                self.push_prep_progress(progress, &mut events);
            }
            PredictionChannelMessage::ToolCallGenerationStart => {
                tracing::debug!("notified of pending tool call request generation");
            }
            PredictionChannelMessage::ToolCallGenerationEnd { tool_call_request } => {
                events.push(PredictionEvent::ToolCall(tool_call_request));
            }
            PredictionChannelMessage::ToolCallGenerationFailed => {
                tracing::warn!("tool call request generation failed");
                events.push(PredictionEvent::ToolCallAborted);
            }
            PredictionChannelMessage::Error { error } => {
                return Err(Error::Server(
                    ServerError::from_details("Prediction error", error)
                        .with_kind(ServerErrorKind::Prediction),
                ));
            }
            PredictionChannelMessage::Success {
                stats,
                model_info,
                load_model_config,
                prediction_config,
            } => {
                self.finish(
                    SuccessPayload {
                        stats,
                        model_info,
                        load_model_config,
                        prediction_config,
                    },
                    &mut events,
                );
            }
        }
        Ok(events)
    }

    fn handle_event(&mut self, event: &PredictionEvent) {
        match event {
            PredictionEvent::PrepProgress(progress) => {
                if let Some(callback) = self.on_prompt_progress.as_mut() {
                    invoke_callback("Prediction", "prompt processing progress", || {
                        callback(*progress)
                    });
                }
            }
            PredictionEvent::Fragment(fragment) => {
                if let Some(mut callback) = self.on_first_token.take() {
                    invoke_callback("Prediction", "first token", || callback());
                }
                if let Some(callback) = self.on_fragment.as_mut() {
                    invoke_callback("Prediction", "fragment", || callback(fragment));
                }
            }
            PredictionEvent::ToolCall(request) => {
                self.pending_tool_calls.push(request.clone());
            }
            PredictionEvent::ToolCallAborted => {}
            PredictionEvent::Finished => {}
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> Result<PredictionResult> {
        if !self.finished {
            return Err(Error::usage(
                "Prediction result read from an active channel",
            ));
        }
        self.result
            .take()
            .ok_or_else(|| Error::usage("Prediction result has already been taken"))
    }

    fn notify_cancelled(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> PredictionRequest {
        PredictionRequest {
            model_specifier: json!({"type": "query", "query": {"identifier": "qwen2.5-7b"}}),
            history: json!({"messages": []}),
            prediction_config_stack: json!({"layers": []}),
            fuzzy_preset_identifier: None,
        }
    }

    fn fragment_contents(text: &str) -> Value {
        json!({"type": "fragment", "fragment": {"content": text}})
    }

    fn success_contents() -> Value {
        json!({
            "type": "success",
            "stats": {"tokensPerSecond": 42.0},
            "modelInfo": {"identifier": "qwen2.5-7b"},
            "loadModelConfig": {},
            "predictionConfig": {},
        })
    }

    fn drive(endpoint: &mut PredictionEndpoint, contents: Value) -> Vec<PredictionEvent> {
        endpoint.handle_message(Some(&contents)).unwrap()
    }

    #[test]
    fn fragments_accumulate_into_final_content() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        drive(&mut endpoint, fragment_contents("Hello"));
        drive(&mut endpoint, fragment_contents(", world"));
        drive(&mut endpoint, success_contents());
        let result = endpoint.take_result().unwrap();
        assert_eq!(result.content, "Hello, world");
        assert!(!result.structured);
        assert_eq!(result.parsed, json!("Hello, world"));
    }

    #[test]
    fn first_token_callback_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut endpoint = PredictionEndpoint::new(request(), false)
            .on_first_token(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        drive(&mut endpoint, fragment_contents("a"));
        drive(&mut endpoint, fragment_contents("b"));
        drive(&mut endpoint, fragment_contents("c"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_fragment_synthesizes_prep_completion() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        let events = drive(&mut endpoint, fragment_contents("hi"));
        assert_eq!(
            events,
            vec![
                PredictionEvent::PrepProgress(0.0),
                PredictionEvent::PrepProgress(1.0),
                PredictionEvent::Fragment(PredictionFragment {
                    content: "hi".to_string(),
                    tokens_count: 0,
                    contains_drafted: false,
                    reasoning_type: FragmentReasoningType::None,
                }),
            ]
        );
    }

    #[test]
    fn prep_progress_is_strictly_increasing() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        let mut emitted = Vec::new();
        for progress in [0.3, 0.3, 0.2, 0.6] {
            let contents = json!({"type": "promptProcessingProgress", "progress": progress});
            for event in drive(&mut endpoint, contents) {
                if let PredictionEvent::PrepProgress(p) = event {
                    emitted.push(p);
                }
            }
        }
        // Leading 0.0 is synthesized for the first observed progress.
        assert_eq!(emitted, vec![0.0, 0.3, 0.6]);
    }

    #[test]
    fn cancel_discards_later_fragments_but_keeps_earlier_content() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        drive(&mut endpoint, fragment_contents("kept"));
        endpoint.notify_cancelled();
        for _ in 0..3 {
            let events = drive(&mut endpoint, fragment_contents(" dropped"));
            assert!(events.is_empty());
        }
        drive(&mut endpoint, success_contents());
        let result = endpoint.take_result().unwrap();
        assert_eq!(result.content, "kept");
        assert!(!result.structured);
    }

    #[test]
    fn structured_result_decodes_json_object() {
        let mut endpoint = PredictionEndpoint::new(request(), true);
        drive(&mut endpoint, fragment_contents(r#"{"answer":"#));
        drive(&mut endpoint, fragment_contents("42}"));
        drive(&mut endpoint, success_contents());
        let result = endpoint.take_result().unwrap();
        assert!(result.structured);
        assert_eq!(result.parsed, json!({"answer": 42}));
        assert_eq!(result.content, r#"{"answer":42}"#);
    }

    #[test]
    fn structured_request_falls_back_to_text_on_invalid_json() {
        let mut endpoint = PredictionEndpoint::new(request(), true);
        drive(&mut endpoint, fragment_contents("not json at all"));
        drive(&mut endpoint, success_contents());
        let result = endpoint.take_result().unwrap();
        assert!(!result.structured);
        assert_eq!(result.parsed, json!("not json at all"));
    }

    #[test]
    fn structured_request_falls_back_on_non_object_json() {
        let mut endpoint = PredictionEndpoint::new(request(), true);
        drive(&mut endpoint, fragment_contents("[1, 2, 3]"));
        drive(&mut endpoint, success_contents());
        let result = endpoint.take_result().unwrap();
        assert!(!result.structured);
    }

    #[test]
    fn tool_call_events_are_surfaced_and_tracked() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        drive(
            &mut endpoint,
            json!({"type": "toolCallGenerationStart"}),
        );
        let events = drive(
            &mut endpoint,
            json!({
                "type": "toolCallGenerationEnd",
                "toolCallRequest": {"id": "call-1", "name": "add", "arguments": {"a": 1}},
            }),
        );
        assert!(matches!(events[0], PredictionEvent::ToolCall(_)));
        let pending = endpoint.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "add");

        let events = drive(&mut endpoint, json!({"type": "toolCallGenerationFailed"}));
        assert_eq!(events, vec![PredictionEvent::ToolCallAborted]);
    }

    #[test]
    fn server_error_message_raises_prediction_error() {
        let mut endpoint = PredictionEndpoint::new(request(), false);
        let outcome = endpoint.handle_message(Some(
            &json!({"type": "error", "error": {"title": "out of context"}}),
        ));
        match outcome {
            Err(Error::Server(err)) => assert_eq!(err.kind, ServerErrorKind::Prediction),
            other => panic!("expected prediction error, got {other:?}"),
        }
    }

    #[test]
    fn callback_panic_does_not_poison_the_stream() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let mut endpoint = PredictionEndpoint::new(request(), false)
            .on_fragment(move |fragment| {
                seen.fetch_add(1, Ordering::SeqCst);
                if fragment.content == "boom" {
                    panic!("observer bug");
                }
            });
        drive(&mut endpoint, fragment_contents("boom"));
        drive(&mut endpoint, fragment_contents("fine"));
        drive(&mut endpoint, success_contents());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.take_result().unwrap().content, "boomfine");
    }
}
