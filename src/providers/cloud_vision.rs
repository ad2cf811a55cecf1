//! Hosted multimodal generation API (`streamGenerateContent` over SSE).

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::{probe_ok, relay_tokens, send_streaming, FrameStream, LineEvent, Provider};
use crate::codec::{sse_data, Frame};
use crate::prompt::build_prompt;
use crate::schema::{ExtractionRequest, ProviderConfig};

const NAME: &str = "cloud_vision";
const CLOUD_VISION_HOST: &str = "generativelanguage.googleapis.com";

/// Whether `base_url` points at the hosted generative-language API.
pub fn is_cloud_vision_url(base_url: &str) -> bool {
    base_url.contains(CLOUD_VISION_HOST) || base_url.trim_end_matches('/').ends_with("/v1beta")
}

pub struct CloudVisionProvider {
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl CloudVisionProvider {
    pub fn new(client: reqwest::Client, idle_timeout: Duration) -> Self {
        Self {
            client,
            idle_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Provider for CloudVisionProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_health(&self, config: &ProviderConfig) -> bool {
        let mut request = self.client.get(format!("{}/models", config.base()));
        if let Some(key) = &config.api_key {
            request = request.header("x-goog-api-key", key);
        }
        probe_ok(request).await
    }

    fn stream_extraction(&self, request: ExtractionRequest, config: ProviderConfig) -> FrameStream {
        let client = self.client.clone();
        let idle_timeout = self.idle_timeout;

        Box::pin(async_stream::stream! {
            yield Frame::log(NAME, format!("Using {} via {}", config.model, config.base()));

            let url = format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                config.base(),
                config.model
            );
            let body = GenerateRequest::from_request(&request);
            info!("Cloud vision request: model={}, image={}", config.model, request.has_image());

            let mut http = client.post(url).json(&body);
            if let Some(key) = &config.api_key {
                http = http.header("x-goog-api-key", key);
            }

            let response = match send_streaming(http, idle_timeout).await {
                Ok(response) => response,
                Err(e) => {
                    yield Frame::error(e.to_string());
                    return;
                }
            };

            let mut frames = Box::pin(relay_tokens(response, idle_timeout, parse_line));
            while let Some(frame) = frames.next().await {
                yield frame;
            }
        })
    }
}

/// Token at `candidates[0].content.parts[0].text` of an SSE `data:` line.
fn parse_line(line: &str) -> LineEvent {
    let Some(payload) = sse_data(line) else {
        return LineEvent::Skip;
    };
    let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
        return LineEvent::Skip;
    };
    match chunk
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
    {
        Some(text) => LineEvent::Token(text.to_string()),
        None => LineEvent::Skip,
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
}

impl GenerateRequest {
    fn from_request(request: &ExtractionRequest) -> Self {
        let mut parts = vec![Part::Text {
            text: build_prompt(request),
        }];
        if let Some((mime_type, data)) = request.image() {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type,
                    data: data.to_string(),
                },
            });
        }
        Self {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: request
                .temperature()
                .map(|temperature| GenerationConfig { temperature }),
        }
    }
}
