//! Strategy orchestration: which provider(s) run for a request, and how
//! their frame streams are composed.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::codec::Frame;
use crate::providers::{terminated, FrameStream, ProviderKind, Providers};
use crate::schema::{ExtractionRequest, ProviderConfig, Strategy, ValidatedRequest};

const TAG: &str = "orchestrator";
const DEFAULT_OCR_MODEL: &str = "paddleocr";

#[derive(Clone)]
pub struct Orchestrator {
    providers: Providers,
}

impl Orchestrator {
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Compose the frame stream for one validated request. The result ends
    /// with exactly one terminal frame.
    pub fn run(&self, validated: ValidatedRequest) -> FrameStream {
        let ValidatedRequest {
            request,
            provider,
            strategy,
        } = validated;

        match strategy {
            Strategy::Direct => {
                let (kind, selected) = self.providers.select(&provider);
                info!("Direct extraction: provider={:?}, model={}", kind, provider.model);
                terminated(selected.stream_extraction(request, provider))
            }
            Strategy::Chained => terminated(self.chained(request, provider)),
        }
    }

    /// Local OCR first, then its text through the text-capable provider.
    fn chained(&self, request: ExtractionRequest, provider: ProviderConfig) -> FrameStream {
        let ocr = Arc::clone(&self.providers.local_ocr);
        let (kind, text_provider) = self.providers.select(&provider);

        Box::pin(async_stream::stream! {
            if kind == ProviderKind::LocalOcr {
                yield Frame::error(format!(
                    "Chained strategy needs a text-capable model for the second stage, got {}",
                    provider.model
                ));
                return;
            }

            let ocr_config = ocr_stage_config(&provider);
            info!("Chained extraction: ocr={}, then {:?} model={}", ocr_config.model, kind, provider.model);
            yield Frame::log(TAG, format!("Stage 1: OCR with {}", ocr_config.model));

            let mut text = None;
            let mut stage_one = terminated(ocr.stream_extraction(request.clone(), ocr_config));
            while let Some(frame) = stage_one.next().await {
                match frame {
                    Frame::Final { event } => {
                        let extracted = event
                            .get("extracted_text")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        yield Frame::log(
                            TAG,
                            format!(
                                "OCR stage finished ({} characters)",
                                extracted.as_deref().map_or(0, |t| t.chars().count())
                            ),
                        );
                        text = extracted;
                    }
                    error @ Frame::Error { .. } => {
                        yield error;
                        return;
                    }
                    log => yield log,
                }
            }

            let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
                yield Frame::error("OCR stage produced no text");
                return;
            };

            yield Frame::log(TAG, format!("Stage 2: extracting with {}", provider.model));
            let derived = request.with_ocr_text(text);
            let mut stage_two = terminated(text_provider.stream_extraction(derived, provider));
            while let Some(frame) = stage_two.next().await {
                yield frame;
            }
        })
    }
}

/// Provider config for the OCR stage: `options.ocr_model`, default
/// `paddleocr`, against the same base URL.
fn ocr_stage_config(provider: &ProviderConfig) -> ProviderConfig {
    let model = provider
        .option_str("ocr_model")
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(DEFAULT_OCR_MODEL);
    ProviderConfig {
        base_url: provider.base_url.clone(),
        api_key: None,
        model: model.to_string(),
        options: provider.options.clone(),
    }
}
