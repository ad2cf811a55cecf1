//! Application configuration.
//!
//! Everything is read from the environment (a `.env` file is loaded by the
//! binary first). The bridge's active tier is the one piece of state that is
//! persisted to disk, in `<bridge root>/bridge_config.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::schema::RequestDefaults;
use crate::supervisor::Tier;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_RECORDS_PATH: &str = "data/records.json";
const DEFAULT_STREAM_IDLE_SECS: u64 = 120;

const DEFAULT_BRIDGE_HOST: &str = "127.0.0.1";
const DEFAULT_BRIDGE_PORT: u16 = 5000;
const DEFAULT_BRIDGE_SCRIPT: &str = "bridge/paddle_bridge.py";

/// Health poll cadence while the bridge boots: 300 × 1s.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_ATTEMPTS: u32 = 300;

/// Top-level configuration for the server binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub default_base_url: String,
    pub default_api_key: Option<String>,
    pub records_path: PathBuf,
    /// Longest silence tolerated on a streaming provider body.
    pub stream_idle_timeout: Duration,
    pub bridge: BridgeConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            port: env_parse("PORT", DEFAULT_PORT)?,
            default_base_url: env_or("DEFAULT_BASE_URL", DEFAULT_BASE_URL),
            default_api_key: std::env::var("DEFAULT_API_KEY").ok().filter(|k| !k.is_empty()),
            records_path: PathBuf::from(env_or("RECORDS_PATH", DEFAULT_RECORDS_PATH)),
            stream_idle_timeout: Duration::from_secs(env_parse(
                "STREAM_IDLE_TIMEOUT_SECS",
                DEFAULT_STREAM_IDLE_SECS,
            )?),
            bridge: BridgeConfig::from_env()?,
        };
        info!(
            "Config: port={}, default_base_url={}, records={:?}, bridge={}",
            config.port,
            config.default_base_url,
            config.records_path,
            config.bridge.url()
        );
        Ok(config)
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            base_url: self.default_base_url.clone(),
            api_key: self.default_api_key.clone(),
        }
    }
}

/// Where and how the local OCR bridge runs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Holds the virtual environment, model caches and `bridge_config.json`.
    pub root: PathBuf,
    pub script: PathBuf,
    /// Interpreter used to create the virtual environment.
    pub system_python: String,
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Kill whatever still listens on `port` after stopping the process.
    pub free_port_on_stop: bool,
    pub autostart: bool,
    /// Replaces `<venv python> <script>`; `--tier <tier>` is still appended.
    pub command: Option<Vec<String>>,
}

impl BridgeConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            script: root.join(DEFAULT_BRIDGE_SCRIPT),
            root,
            system_python: "python3".to_string(),
            host: DEFAULT_BRIDGE_HOST.to_string(),
            port: DEFAULT_BRIDGE_PORT,
            poll_interval: POLL_INTERVAL,
            poll_attempts: POLL_ATTEMPTS,
            free_port_on_stop: true,
            autostart: true,
            command: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(env_or("BRIDGE_ROOT", "."));
        if let Ok(script) = std::env::var("BRIDGE_SCRIPT") {
            config.script = PathBuf::from(script);
        }
        config.system_python = env_or("BRIDGE_PYTHON", &config.system_python);
        config.host = env_or("BRIDGE_HOST", &config.host);
        config.port = env_parse("BRIDGE_PORT", config.port)?;
        config.autostart = env_parse("BRIDGE_AUTOSTART", config.autostart)?;
        Ok(config)
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.root.join(".venv")
    }

    /// Interpreter inside the virtual environment; its presence marks the
    /// base runtime as installed.
    pub fn venv_python(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir().join("Scripts").join("python.exe")
        } else {
            self.venv_dir().join("bin").join("python")
        }
    }

    /// Marker written once a tier's dependency set installed cleanly.
    pub fn tier_marker(&self, tier: Tier) -> PathBuf {
        self.venv_dir().join(format!(".tier-{}", tier))
    }

    /// Per-tier model cache so tiers never share downloads.
    pub fn cache_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(".paddle_cache").join(tier.as_str())
    }

    pub fn tier_file(&self) -> PathBuf {
        self.root.join("bridge_config.json")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBridge {
    active_tier: Tier,
}

/// Durable record of the bridge's active tier.
#[derive(Debug, Clone)]
pub struct TierStore {
    path: PathBuf,
}

impl TierStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persisted tier, `eco` when nothing usable is on disk.
    pub fn load(&self) -> Tier {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return Tier::default(),
        };
        match serde_json::from_str::<PersistedBridge>(&content) {
            Ok(persisted) => persisted.active_tier,
            Err(e) => {
                warn!("Ignoring unreadable tier file {:?}: {}", self.path, e);
                Tier::default()
            }
        }
    }

    pub fn save(&self, tier: Tier) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(&PersistedBridge { active_tier: tier })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to persist tier to {:?}", self.path))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        _ => Ok(default),
    }
}
