//! Provider abstraction.
//!
//! Defines the [`Provider`] trait and the shared streaming machinery so that
//! different backends (cloud vision API, chat-completion servers, the local
//! OCR bridge) all produce the same frame stream.

pub mod chat_completion;
pub mod cloud_vision;
pub mod local_ocr;

pub use chat_completion::ChatCompletionProvider;
pub use cloud_vision::CloudVisionProvider;
pub use local_ocr::LocalOcrProvider;

use futures::stream::{Stream, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::codec::{Frame, LineBuffer};
use crate::error::ProviderError;
use crate::schema::{ExtractionRequest, ProviderConfig};

/// Timeout for `check_health` probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default longest silence tolerated on a streaming body.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Live, single-consumer sequence of frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Async trait implemented by each backend.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Tag used on this provider's `log` frames.
    fn name(&self) -> &'static str;

    /// Lightweight reachability probe. Never fails; any problem is `false`.
    async fn check_health(&self, config: &ProviderConfig) -> bool;

    /// Start the backend call. The stream announces provider and model in a
    /// `log` frame first and ends with exactly one `final` or `error` frame.
    fn stream_extraction(&self, request: ExtractionRequest, config: ProviderConfig) -> FrameStream;
}

/// Known provider identifiers used for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    CloudVision,
    ChatCompletion,
    LocalOcr,
}

impl ProviderKind {
    /// Local OCR model ids win, then cloud-vision hosts, then everything
    /// else is a chat-completion server.
    pub fn resolve(config: &ProviderConfig) -> Self {
        if local_ocr::is_local_ocr_model(&config.model) {
            Self::LocalOcr
        } else if cloud_vision::is_cloud_vision_url(&config.base_url) {
            Self::CloudVision
        } else {
            Self::ChatCompletion
        }
    }
}

/// One instance of every provider, shared across requests.
#[derive(Clone)]
pub struct Providers {
    pub cloud_vision: Arc<dyn Provider>,
    pub chat: Arc<dyn Provider>,
    pub local_ocr: Arc<dyn Provider>,
}

impl Providers {
    pub fn get(&self, kind: ProviderKind) -> Arc<dyn Provider> {
        match kind {
            ProviderKind::CloudVision => Arc::clone(&self.cloud_vision),
            ProviderKind::ChatCompletion => Arc::clone(&self.chat),
            ProviderKind::LocalOcr => Arc::clone(&self.local_ocr),
        }
    }

    pub fn select(&self, config: &ProviderConfig) -> (ProviderKind, Arc<dyn Provider>) {
        let kind = ProviderKind::resolve(config);
        (kind, self.get(kind))
    }
}

// ============================================================================
// Shared HTTP helpers
// ============================================================================

/// Send a request, mapping transport failures and non-2xx answers.
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::rejected(status, &body));
    }
    Ok(response)
}

/// [`send_checked`] for streaming calls: waiting for the response headers
/// counts against the same idle timeout as the body.
pub(crate) async fn send_streaming(
    request: reqwest::RequestBuilder,
    idle_timeout: Duration,
) -> Result<reqwest::Response, ProviderError> {
    tokio::time::timeout(idle_timeout, send_checked(request))
        .await
        .map_err(|_| ProviderError::Stalled(idle_timeout.as_secs()))?
}

/// `true` when the probe answers 2xx within [`HEALTH_TIMEOUT`].
pub(crate) async fn probe_ok(request: reqwest::RequestBuilder) -> bool {
    match request.timeout(HEALTH_TIMEOUT).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!("Health probe failed: {}", e);
            false
        }
    }
}

// ============================================================================
// Token relay
// ============================================================================

/// What one line of a streaming body means.
#[derive(Debug, PartialEq)]
pub(crate) enum LineEvent {
    Token(String),
    Done,
    Skip,
}

/// Relay a streaming body: every token becomes a `token` log frame and is
/// accumulated; at the end the accumulated text is turned into the final
/// frame.
pub(crate) fn relay_tokens<F>(
    response: reqwest::Response,
    idle_timeout: Duration,
    parse_line: F,
) -> impl Stream<Item = Frame> + Send
where
    F: Fn(&str) -> LineEvent + Send + 'static,
{
    async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut tokens = TokenAccumulator::default();
        let mut done = false;

        while !done {
            let chunk = match tokio::time::timeout(idle_timeout, body.next()).await {
                Err(_) => {
                    yield Frame::error(ProviderError::Stalled(idle_timeout.as_secs()).to_string());
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    yield Frame::error(ProviderError::from(e).to_string());
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for line in lines.push(&chunk) {
                match parse_line(&line) {
                    LineEvent::Token(token) => {
                        if tokens.push(&token) {
                            yield Frame::log("token", token);
                        }
                    }
                    LineEvent::Done => {
                        done = true;
                        break;
                    }
                    LineEvent::Skip => {}
                }
            }
        }

        if !done {
            if let Some(line) = lines.finish() {
                if let LineEvent::Token(token) = parse_line(&line) {
                    if tokens.push(&token) {
                        yield Frame::log("token", token);
                    }
                }
            }
        }

        debug!("Stream finished: {} tokens, {} chars", tokens.count(), tokens.text().len());
        yield tokens.into_frame();
    }
}

/// Ordered concatenation of non-empty tokens.
#[derive(Debug, Default)]
pub struct TokenAccumulator {
    text: String,
    count: usize,
}

impl TokenAccumulator {
    /// Append a token; empty tokens are ignored. Returns whether it was kept.
    pub fn push(&mut self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.text.push_str(token);
        self.count += 1;
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `final` with the recovered payload, or the malformed-output `error`.
    pub fn into_frame(self) -> Frame {
        match recover_json(&self.text) {
            Some(event) => Frame::final_event(event),
            None => Frame::error(ProviderError::MalformedOutput.to_string()),
        }
    }
}

/// Recover the JSON payload from model output that may carry prose around
/// it. Greedy match on the outermost braces first, then brackets. Arrays
/// are wrapped as `{"events": [...]}` so the result is always an object.
///
/// Code fences are not stripped separately; the greedy match reaches inside
/// them, but output with several separate JSON blocks will not parse.
pub fn recover_json(text: &str) -> Option<Value> {
    static OBJECT: OnceLock<Regex> = OnceLock::new();
    static ARRAY: OnceLock<Regex> = OnceLock::new();
    let object = OBJECT.get_or_init(|| Regex::new(r"\{[\s\S]*\}").expect("valid object regex"));
    let array = ARRAY.get_or_init(|| Regex::new(r"\[[\s\S]*\]").expect("valid array regex"));

    let parse = |re: &Regex| {
        re.find(text)
            .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
    };

    match parse(object).or_else(|| parse(array))? {
        value @ Value::Object(_) => Some(value),
        Value::Array(items) => Some(json!({ "events": items })),
        _ => None,
    }
}

/// Enforce the terminal-frame invariant on any stream: stop after the first
/// `final`/`error`, and close a stream that ends without one with an error.
pub fn terminated(inner: FrameStream) -> FrameStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        while let Some(frame) = inner.next().await {
            let terminal = frame.is_terminal();
            yield frame;
            if terminal {
                return;
            }
        }
        yield Frame::error("Provider stream ended without a result");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_recover_json_with_prose() {
        let text = r#"Sure! {"title":"Invoice","amount":12.5} Thanks."#;
        assert_eq!(
            recover_json(text),
            Some(json!({"title": "Invoice", "amount": 12.5}))
        );
    }

    #[test]
    fn test_recover_json_inside_fence() {
        let text = "```json\n{\"title\": \"Standup\", \"date\": \"2026-10-16\"}\n```";
        assert_eq!(
            recover_json(text),
            Some(json!({"title": "Standup", "date": "2026-10-16"}))
        );
    }

    #[test]
    fn test_recover_json_array_is_wrapped() {
        let text = r#"Here: [{"title":"A"},{"title":"B"}]"#;
        assert_eq!(
            recover_json(text),
            Some(json!({"events": [{"title": "A"}, {"title": "B"}]}))
        );
    }

    #[test]
    fn test_recover_json_failures() {
        assert_eq!(recover_json("no json here"), None);
        assert_eq!(recover_json("{ broken: "), None);
        // Greedy match spans both objects and fails to parse.
        assert_eq!(recover_json(r#"{"a":1} and {"b":2}"#), None);
    }

    #[test]
    fn test_accumulator_skips_empty_tokens() {
        let mut acc = TokenAccumulator::default();
        assert!(acc.push("{\"title\":"));
        assert!(!acc.push(""));
        assert!(acc.push("\"Test\"}"));
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.into_frame(), Frame::final_event(json!({"title": "Test"})));
    }

    #[test]
    fn test_accumulator_malformed_output() {
        let mut acc = TokenAccumulator::default();
        acc.push("I could not read the image.");
        assert_eq!(
            acc.into_frame(),
            Frame::error("Model response did not contain valid JSON")
        );
    }

    #[test]
    fn test_resolve_provider_kind() {
        let cases = [
            ("https://generativelanguage.googleapis.com/v1beta", "gemini-2.0-flash", ProviderKind::CloudVision),
            ("https://generativelanguage.googleapis.com/v1beta", "paddleocr", ProviderKind::LocalOcr),
            ("http://localhost:11434", "llama3.2-vision", ProviderKind::ChatCompletion),
            ("https://openrouter.ai/api/v1", "openai/gpt-4o", ProviderKind::ChatCompletion),
            ("http://localhost:11434", "paddleocr-vl", ProviderKind::LocalOcr),
        ];
        for (base, model, expected) in cases {
            let config = ProviderConfig::new(base, model);
            assert_eq!(ProviderKind::resolve(&config), expected, "{base} {model}");
        }
    }

    #[tokio::test]
    async fn test_terminated_stops_after_terminal() {
        let inner: FrameStream = Box::pin(stream::iter(vec![
            Frame::log("t", "one"),
            Frame::error("first"),
            Frame::log("t", "late"),
            Frame::final_event(json!({})),
        ]));
        let frames: Vec<Frame> = terminated(inner).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Frame::error("first"));
    }

    #[tokio::test]
    async fn test_terminated_closes_open_stream() {
        let inner: FrameStream = Box::pin(stream::iter(vec![Frame::log("t", "one")]));
        let frames: Vec<Frame> = terminated(inner).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_terminal());
        assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
    }
}
