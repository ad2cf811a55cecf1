//! Local OCR bridge provider.
//!
//! Makes sure the supervised bridge runs under a tier able to serve the
//! requested model, then performs one blocking `/ocr` call and synthesizes
//! frames around it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{send_checked, FrameStream, Provider};
use crate::codec::Frame;
use crate::error::ProviderError;
use crate::schema::{ExtractionRequest, ProviderConfig};
use crate::supervisor::{BridgeState, Supervisor, Tier};

const NAME: &str = "local_ocr";

/// Upper bound on one OCR call; vision-language tiers are slow on CPU.
const OCR_TIMEOUT: Duration = Duration::from_secs(600);

/// Model ids served by the bridge rather than an LLM server.
pub fn is_local_ocr_model(model: &str) -> bool {
    model.trim().to_ascii_lowercase().starts_with("paddleocr")
}

/// Tier able to serve `model`: explicit `options.tier`, else `lite` for
/// vision-language model ids, else `eco`.
pub fn required_tier(model: &str, request: &ExtractionRequest) -> Result<Tier, ProviderError> {
    if let Some(raw) = request.options.get("tier").and_then(|v| v.as_str()) {
        return raw.parse().map_err(ProviderError::Bridge);
    }
    if model.to_ascii_lowercase().contains("vl") {
        Ok(Tier::Lite)
    } else {
        Ok(Tier::Eco)
    }
}

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    image_base64: &'a str,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    result: String,
}

pub struct LocalOcrProvider {
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
}

impl LocalOcrProvider {
    pub fn new(supervisor: Arc<Supervisor>, client: reqwest::Client) -> Self {
        Self { supervisor, client }
    }
}

/// Tier the bridge is running under, as reported by `/health` or tracked by
/// the supervisor.
async fn current_tier(supervisor: &Supervisor, reported: Option<Tier>) -> Tier {
    match reported {
        Some(tier) => tier,
        None => supervisor
            .running_tier()
            .await
            .unwrap_or_else(|| supervisor.active_tier()),
    }
}

#[async_trait::async_trait]
impl Provider for LocalOcrProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn check_health(&self, _config: &ProviderConfig) -> bool {
        self.supervisor.probe().await.is_some_and(|h| h.is_ready())
    }

    fn stream_extraction(&self, request: ExtractionRequest, config: ProviderConfig) -> FrameStream {
        let supervisor = Arc::clone(&self.supervisor);
        let client = self.client.clone();

        Box::pin(async_stream::stream! {
            yield Frame::log(NAME, format!("Using {} via bridge {}", config.model, supervisor.url()));

            let Some(image) = request.base64_image.as_deref().filter(|s| !s.is_empty()) else {
                yield Frame::error("Local OCR requires an image");
                return;
            };

            let required = match required_tier(&config.model, &request) {
                Ok(tier) => tier,
                Err(e) => {
                    yield Frame::error(e.to_string());
                    return;
                }
            };

            let mut health = supervisor.probe().await.filter(|h| h.is_ready());
            if health.is_none() {
                yield Frame::log(NAME, "Bridge not ready, starting it");
                if supervisor.start(None).await != BridgeState::Healthy {
                    yield Frame::error(
                        ProviderError::Bridge("bridge failed to start, see bridge logs".to_string())
                            .to_string(),
                    );
                    return;
                }
                health = supervisor.probe().await.filter(|h| h.is_ready());
            }

            let mut tier = current_tier(&supervisor, health.and_then(|h| h.tier)).await;
            if tier < required {
                yield Frame::log(NAME, format!("Switching bridge from {} to {} tier", tier, required));
                let state = supervisor.set_active_tier(required).await;
                if state != BridgeState::Healthy {
                    yield Frame::error(
                        ProviderError::Bridge(format!(
                            "bridge did not come up under tier {} ({:?})",
                            required, state
                        ))
                        .to_string(),
                    );
                    return;
                }
                tier = required;
            }

            yield Frame::log(NAME, format!("Running OCR on tier {}", tier));
            info!("Local OCR request: model={}, tier={}", config.model, tier);

            let http = client
                .post(format!("{}/ocr", supervisor.url()))
                .timeout(OCR_TIMEOUT)
                .json(&OcrRequest { image_base64: image });

            let result = match send_checked(http).await {
                Ok(response) => response
                    .json::<OcrResponse>()
                    .await
                    .map_err(|e| ProviderError::Bridge(format!("unexpected /ocr response: {}", e))),
                Err(e) => Err(e),
            };

            match result {
                Ok(ocr) => {
                    yield Frame::log(NAME, format!("Extracted {} characters", ocr.result.chars().count()));
                    yield Frame::final_event(json!({
                        "extracted_text": ocr.result,
                        "tier": tier,
                        "provider": NAME,
                    }));
                }
                Err(e) => yield Frame::error(e.to_string()),
            }
        })
    }
}
