//! Capability tiers of the local OCR bridge.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered capability level: `eco < lite < pro`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// CPU-only OCR engine.
    #[default]
    Eco,
    /// Vision-language model, 4-bit quantized.
    Lite,
    /// Vision-language model, full precision.
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Eco, Tier::Lite, Tier::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Eco => "eco",
            Tier::Lite => "lite",
            Tier::Pro => "pro",
        }
    }

    /// Whether the tier needs the vision-language dependency bundle.
    pub fn is_vision_language(&self) -> bool {
        *self >= Tier::Lite
    }

    /// Python packages installed for this tier, on top of the base runtime.
    pub fn packages(&self) -> Vec<&'static str> {
        let mut packages = vec![
            "paddlepaddle",
            "paddleocr",
            "fastapi",
            "uvicorn",
            "pydantic",
            "pillow",
            "numpy",
        ];
        if self.is_vision_language() {
            packages.extend(["torch", "transformers", "accelerate"]);
        }
        if *self == Tier::Lite {
            packages.push("bitsandbytes");
        }
        packages
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eco" => Ok(Tier::Eco),
            "lite" => Ok(Tier::Lite),
            "pro" => Ok(Tier::Pro),
            other => Err(format!("Unknown tier: {} (expected eco, lite or pro)", other)),
        }
    }
}
