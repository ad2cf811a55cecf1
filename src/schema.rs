//! Request types shared by the providers and the orchestrator.
//!
//! The HTTP layer decodes an [`InboundRequest`] and validates it into an
//! [`ExtractionRequest`], a [`ProviderConfig`] and a [`Strategy`] before any
//! backend is contacted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::RequestError;

/// Normalized extraction input, passed by value to providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today_date: Option<String>,
    /// Raw base64, without any `data:` URI prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ExtractionRequest {
    /// Derived request for the second stage of a chain: OCR text replaces
    /// the original text and the image is dropped.
    pub fn with_ocr_text(&self, text: impl Into<String>) -> Self {
        Self {
            ocr_text: Some(text.into()),
            base64_image: None,
            ..self.clone()
        }
    }

    pub fn has_image(&self) -> bool {
        self.base64_image.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// `(mime_type, base64)` of the attached image.
    pub fn image(&self) -> Option<(&'static str, &str)> {
        let data = self.base64_image.as_deref().filter(|s| !s.is_empty())?;
        Some((sniff_mime(data), data))
    }

    /// `temperature` request option, when numeric.
    pub fn temperature(&self) -> Option<f64> {
        self.options.get("temperature").and_then(Value::as_f64)
    }
}

/// Target backend for one request. Built per request, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            options: Map::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Base URL without a trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// How a request is routed through the providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Flags `A` (default) and `C`: one provider, frames passed through.
    #[default]
    Direct,
    /// Flag `B`: local OCR first, its text fed to an LLM.
    Chained,
}

impl FromStr for Strategy {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "A" | "a" | "C" | "c" | "direct" => Ok(Self::Direct),
            "B" | "b" | "chained" => Ok(Self::Chained),
            other => Err(RequestError::Invalid(format!("Unknown strategy: {}", other))),
        }
    }
}

/// Wire shape of an extraction request, as decoded by the HTTP layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundRequest {
    #[serde(default)]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub image_context: Option<String>,
    #[serde(default)]
    pub today_date: Option<String>,
    #[serde(default, alias = "image")]
    pub base64_image: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Fallbacks applied during validation.
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub request: ExtractionRequest,
    pub provider: ProviderConfig,
    pub strategy: Strategy,
}

impl InboundRequest {
    pub fn validate(self, defaults: &RequestDefaults) -> Result<ValidatedRequest, RequestError> {
        let model = self.model.trim().to_string();
        if model.is_empty() {
            return Err(RequestError::Invalid("model is required".to_string()));
        }

        let strategy = match self.strategy.as_deref() {
            Some(flag) => flag.parse()?,
            None => Strategy::Direct,
        };

        let base64_image = match non_empty(self.base64_image) {
            Some(raw) => Some(normalize_image(&raw)?),
            None => None,
        };
        let ocr_text = non_empty(self.ocr_text);

        if base64_image.is_none() && ocr_text.is_none() {
            return Err(RequestError::Invalid(
                "either ocr_text or base64_image must be provided".to_string(),
            ));
        }

        let base_url = non_empty(self.base_url).unwrap_or_else(|| defaults.base_url.clone());
        let api_key = non_empty(self.api_key).or_else(|| defaults.api_key.clone());

        Ok(ValidatedRequest {
            request: ExtractionRequest {
                ocr_text,
                image_context: non_empty(self.image_context),
                today_date: non_empty(self.today_date),
                base64_image,
                options: self.options.clone(),
            },
            provider: ProviderConfig {
                base_url,
                api_key,
                model,
                options: self.options,
            },
            strategy,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Strip a `data:<mime>;base64,` prefix and check the payload decodes.
fn normalize_image(raw: &str) -> Result<String, RequestError> {
    let data = match raw.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };
    let data: String = data.chars().filter(|c| !c.is_whitespace()).collect();

    BASE64
        .decode(data.as_bytes())
        .map_err(|e| RequestError::Invalid(format!("base64_image is not valid base64: {}", e)))?;

    Ok(data)
}

/// Guess the MIME type of a base64 image from its magic bytes.
pub fn sniff_mime(data: &str) -> &'static str {
    // 64 base64 chars cover every signature image knows about.
    let head = &data.as_bytes()[..data.len().min(64)];
    let head = &head[..head.len() - head.len() % 4];
    BASE64
        .decode(head)
        .ok()
        .and_then(|bytes| image::guess_format(&bytes).ok())
        .map(|format| format.to_mime_type())
        .unwrap_or("image/jpeg")
}
