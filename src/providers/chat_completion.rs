//! Chat-completion servers.
//!
//! Two wire dialects share this provider:
//! - local servers (`{base}/api/chat`, one JSON object per line, images as a
//!   raw base64 list on the message);
//! - remote OpenAI-style APIs (`{base}/chat/completions`, SSE ending with
//!   `data: [DONE]`, images as `image_url` content parts).
//!
//! A base URL whose last path segment is a version like `v1` selects the
//! remote dialect.

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::{probe_ok, relay_tokens, send_streaming, FrameStream, LineEvent, Provider};
use crate::codec::{sse_data, Frame};
use crate::prompt::build_prompt;
use crate::schema::{ExtractionRequest, ProviderConfig};

const NAME: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Local,
    Remote,
}

impl Dialect {
    pub fn for_base_url(base_url: &str) -> Self {
        let last = base_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let versioned = last.len() > 1
            && last.starts_with('v')
            && last[1..].chars().all(|c| c.is_ascii_digit());
        if versioned {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

pub struct ChatCompletionProvider {
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl ChatCompletionProvider {
    pub fn new(client: reqwest::Client, idle_timeout: Duration) -> Self {
        Self {
            client,
            idle_timeout,
        }
    }

    fn build_request(
        &self,
        dialect: Dialect,
        request: &ExtractionRequest,
        config: &ProviderConfig,
    ) -> reqwest::RequestBuilder {
        match dialect {
            Dialect::Local => self
                .client
                .post(format!("{}/api/chat", config.base()))
                .json(&LocalChatRequest::new(request, config)),
            Dialect::Remote => {
                let http = self
                    .client
                    .post(format!("{}/chat/completions", config.base()))
                    .json(&ChatCompletionRequest::new(request, config));
                with_bearer(http, config)
            }
        }
    }
}

fn with_bearer(http: reqwest::RequestBuilder, config: &ProviderConfig) -> reqwest::RequestBuilder {
    match &config.api_key {
        Some(key) => http.header("Authorization", format!("Bearer {}", key)),
        None => http,
    }
}

#[async_trait::async_trait]
impl Provider for ChatCompletionProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_health(&self, config: &ProviderConfig) -> bool {
        let request = match Dialect::for_base_url(&config.base_url) {
            Dialect::Local => self.client.get(format!("{}/api/tags", config.base())),
            Dialect::Remote => {
                with_bearer(self.client.get(format!("{}/models", config.base())), config)
            }
        };
        probe_ok(request).await
    }

    fn stream_extraction(&self, request: ExtractionRequest, config: ProviderConfig) -> FrameStream {
        let dialect = Dialect::for_base_url(&config.base_url);
        let http = self.build_request(dialect, &request, &config);
        let idle_timeout = self.idle_timeout;

        Box::pin(async_stream::stream! {
            yield Frame::log(NAME, format!("Using {} via {} ({:?})", config.model, config.base(), dialect));
            info!("Chat request: model={}, dialect={:?}, image={}", config.model, dialect, request.has_image());

            let response = match send_streaming(http, idle_timeout).await {
                Ok(response) => response,
                Err(e) => {
                    yield Frame::error(e.to_string());
                    return;
                }
            };

            let mut frames: FrameStream = match dialect {
                Dialect::Local => Box::pin(relay_tokens(response, idle_timeout, parse_local_line)),
                Dialect::Remote => Box::pin(relay_tokens(response, idle_timeout, parse_remote_line)),
            };
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        })
    }
}

/// One NDJSON object: token at `message.content`, `done: true` ends.
fn parse_local_line(line: &str) -> LineEvent {
    let Ok(chunk) = serde_json::from_str::<Value>(line.trim()) else {
        return LineEvent::Skip;
    };
    if chunk.get("done").and_then(Value::as_bool) == Some(true) {
        return LineEvent::Done;
    }
    match chunk.pointer("/message/content").and_then(Value::as_str) {
        Some(text) => LineEvent::Token(text.to_string()),
        None => LineEvent::Skip,
    }
}

/// SSE `data:` line: token at `choices[0].delta.content`, `[DONE]` ends.
fn parse_remote_line(line: &str) -> LineEvent {
    let Some(payload) = sse_data(line) else {
        return LineEvent::Skip;
    };
    if payload == "[DONE]" {
        return LineEvent::Done;
    }
    let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
        return LineEvent::Skip;
    };
    match chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(text) => LineEvent::Token(text.to_string()),
        None => LineEvent::Skip,
    }
}

// ============================================================================
// Local server request types
// ============================================================================

#[derive(Debug, Serialize)]
struct LocalChatRequest {
    model: String,
    messages: Vec<LocalMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<LocalOptions>,
}

#[derive(Debug, Serialize)]
struct LocalMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LocalOptions {
    temperature: f64,
}

impl LocalChatRequest {
    fn new(request: &ExtractionRequest, config: &ProviderConfig) -> Self {
        let images = request
            .image()
            .map(|(_, data)| vec![data.to_string()])
            .unwrap_or_default();
        Self {
            model: config.model.clone(),
            messages: vec![LocalMessage {
                role: Role::User,
                content: build_prompt(request),
                images,
            }],
            stream: true,
            options: request
                .temperature()
                .map(|temperature| LocalOptions { temperature }),
        }
    }
}

// ============================================================================
// Remote API request types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

impl ChatCompletionRequest {
    fn new(request: &ExtractionRequest, config: &ProviderConfig) -> Self {
        let prompt = build_prompt(request);
        let message = match request.image() {
            Some((mime, data)) => Message::user_with_image(prompt, mime, data),
            None => Message::user(prompt),
        };
        Self {
            model: config.model.clone(),
            messages: vec![message],
            stream: true,
            temperature: request.temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
        }
    }

    /// User message with text and one base64 image as a data URI.
    pub fn user_with_image(text: impl Into<String>, mime: &str, base64: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", mime, base64),
                    },
                },
            ]),
        }
    }
}
