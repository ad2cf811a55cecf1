//! Lifecycle supervisor for the local OCR bridge.
//!
//! The bridge is a long-lived Python process serving `/health` and `/ocr`
//! on a loopback port. [`Supervisor`] installs its runtime, starts it and
//! polls it to readiness, switches tiers by restarting it, and captures its
//! stdout/stderr into a bounded [`LogBuffer`].
//!
//! Failures here are never returned to callers: they land in the log buffer
//! and in [`BridgeState::Failing`], and are discovered through health probes
//! and [`Supervisor::status`].

mod logs;
mod tier;

pub use logs::{classify, strip_ansi, LogBuffer, LogEntry, LogLevel, Source, LOG_CAPACITY};
pub use tier::Tier;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, TierStore};

/// Timeout for a single `/health` probe.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Stopped,
    Starting,
    Healthy,
    Failing,
}

/// Body of the bridge's `/health` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeHealth {
    pub status: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub model: Option<String>,
}

impl BridgeHealth {
    pub fn is_ready(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub installed: bool,
}

/// Point-in-time snapshot, read from the filesystem and the live handle.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub installed: bool,
    pub running: bool,
    pub state: BridgeState,
    pub active_tier: Tier,
    pub tiers: BTreeMap<Tier, TierStatus>,
}

#[derive(Default)]
struct Lifecycle {
    child: Option<Child>,
    tier: Option<Tier>,
    /// Bumped on every spawn/stop so stale poll loops can tell they were
    /// superseded.
    generation: u64,
}

/// Owner of the bridge process. Create one per application and share it
/// behind an `Arc`.
pub struct Supervisor {
    config: BridgeConfig,
    client: reqwest::Client,
    tiers: TierStore,
    logs: LogBuffer,
    lifecycle: Mutex<Lifecycle>,
    install_lock: Mutex<()>,
    state: watch::Sender<BridgeState>,
}

impl Supervisor {
    pub fn new(config: BridgeConfig, client: reqwest::Client) -> Self {
        let tiers = TierStore::new(config.tier_file());
        let (state, _) = watch::channel(BridgeState::Stopped);
        Self {
            config,
            client,
            tiers,
            logs: LogBuffer::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            install_lock: Mutex::new(()),
            state,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Tier persisted as active.
    pub fn active_tier(&self) -> Tier {
        self.tiers.load()
    }

    /// Tier of the tracked process, if one is running.
    pub async fn running_tier(&self) -> Option<Tier> {
        let mut lc = self.lifecycle.lock().await;
        self.reap_locked(&mut lc);
        lc.child.as_ref().and(lc.tier)
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut lc = self.lifecycle.lock().await;
        self.reap_locked(&mut lc);
        lc.child.as_ref().and_then(Child::id)
    }

    /// `GET /health` with a short timeout. `None` on any failure.
    pub async fn probe(&self) -> Option<BridgeHealth> {
        let response = self
            .client
            .get(format!("{}/health", self.url()))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<BridgeHealth>().await.ok()
    }

    pub fn drain_logs(&self) -> Vec<LogEntry> {
        self.logs.drain()
    }

    pub async fn status(&self) -> BridgeStatus {
        let running = {
            let mut lc = self.lifecycle.lock().await;
            self.reap_locked(&mut lc);
            lc.child.is_some()
        };
        let tiers = Tier::ALL
            .iter()
            .map(|tier| {
                let installed = self.config.tier_marker(*tier).exists();
                (*tier, TierStatus { installed })
            })
            .collect();

        BridgeStatus {
            installed: self.config.venv_python().exists(),
            running,
            state: self.state(),
            active_tier: self.tiers.load(),
            tiers,
        }
    }

    // ========================================================================
    // Install
    // ========================================================================

    /// Install the runtime and the tier's dependencies in the background,
    /// then start the bridge under that tier.
    pub fn install(self: &Arc<Self>, tier: Tier) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_install(tier).await {
                this.logs
                    .error(format!("Install failed for tier {}: {:#}", tier, e));
            }
        })
    }

    async fn run_install(&self, tier: Tier) -> Result<()> {
        let _guard = self.install_lock.lock().await;
        self.logs.info(format!("Installing bridge runtime for tier {}", tier));

        let venv_python = self.config.venv_python();
        if venv_python.exists() {
            self.logs.info("Python environment already present, skipping creation");
        } else {
            self.logs.info("Creating Python environment");
            let venv_dir = self.config.venv_dir().to_string_lossy().into_owned();
            self.run_logged(
                &self.config.system_python,
                &["-m".to_string(), "venv".to_string(), venv_dir],
            )
            .await
            .context("Failed to create Python environment")?;
        }

        let mut args: Vec<String> = ["-m", "pip", "install", "--upgrade"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(tier.packages().into_iter().map(String::from));
        self.logs.info(format!(
            "Installing {} packages for tier {}",
            args.len() - 4,
            tier
        ));
        self.run_logged(&venv_python, &args)
            .await
            .with_context(|| format!("Failed to install dependencies for tier {}", tier))?;

        tokio::fs::write(self.config.tier_marker(tier), crate::codec::now_millis().to_string())
            .await
            .context("Failed to write tier marker")?;
        self.tiers.save(tier)?;
        self.logs.info(format!("Tier {} installed", tier));

        self.start(Some(tier)).await;
        Ok(())
    }

    /// Run a command to completion, streaming its output into the log buffer.
    async fn run_logged(&self, program: impl AsRef<OsStr>, args: &[String]) -> Result<()> {
        let program = program.as_ref();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.config.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to launch {:?}", program))?;

        let readers = self.attach_readers(&mut child);
        let status = child.wait().await?;
        for reader in readers {
            let _ = reader.await;
        }

        if !status.success() {
            anyhow::bail!("{:?} exited with {}", program, status);
        }
        Ok(())
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    /// Start the bridge and wait for it to report ready.
    ///
    /// No-op when the tracked process already answers its health probe. A
    /// start arriving while another is in flight for the same tier waits for
    /// that one instead of spawning a second process. The tier defaults to
    /// the persisted one. Returns the state the bridge settled in.
    pub async fn start(&self, tier: Option<Tier>) -> BridgeState {
        let generation = {
            let mut lc = self.lifecycle.lock().await;
            self.reap_locked(&mut lc);
            let tier = tier.unwrap_or_else(|| self.tiers.load());

            if lc.child.is_some() && lc.tier == Some(tier) {
                if self.state() == BridgeState::Starting {
                    drop(lc);
                    debug!("Bridge start already in flight, waiting for it");
                    return self.wait_settled().await;
                }
                if self.probe().await.is_some_and(|h| h.is_ready()) {
                    self.set_state(BridgeState::Healthy);
                    return BridgeState::Healthy;
                }
            }

            match self.spawn_locked(&mut lc, tier).await {
                Ok(generation) => generation,
                Err(state) => return state,
            }
        };

        self.await_ready(generation).await
    }

    /// Persist `tier` and restart the bridge under it. Tiers are never
    /// hot-swapped.
    pub async fn set_active_tier(&self, tier: Tier) -> BridgeState {
        if let Err(e) = self.tiers.save(tier) {
            self.logs
                .error(format!("Failed to persist tier {}: {:#}", tier, e));
        }
        self.logs.info(format!("Switching bridge to tier {}", tier));

        let generation = {
            let mut lc = self.lifecycle.lock().await;
            match self.spawn_locked(&mut lc, tier).await {
                Ok(generation) => generation,
                Err(state) => return state,
            }
        };

        self.await_ready(generation).await
    }

    pub async fn stop(&self) {
        let mut lc = self.lifecycle.lock().await;
        self.stop_locked(&mut lc).await;
    }

    async fn stop_locked(&self, lc: &mut Lifecycle) {
        lc.generation += 1;
        lc.tier = None;
        if let Some(mut child) = lc.child.take() {
            let pid = child.id();
            terminate(&mut child).await;
            self.logs.info(format!("Bridge stopped (pid {:?})", pid));
        }
        if self.config.free_port_on_stop {
            free_port(self.config.port).await;
        }
        self.set_state(BridgeState::Stopped);
    }

    /// Forget a tracked process that has already exited. The generation is
    /// bumped so a poll loop still waiting on it settles on `Failing`.
    fn reap_locked(&self, lc: &mut Lifecycle) {
        let Some(child) = lc.child.as_mut() else {
            return;
        };
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                debug!("Bridge wait failed: {}", e);
                return;
            }
        };
        lc.child = None;
        lc.tier = None;
        lc.generation += 1;
        self.logs.error(format!("Bridge exited ({})", status));
        self.set_state(BridgeState::Failing);
    }

    /// Stop whatever runs, then spawn under `tier`. Returns the new
    /// generation, or the failed state if the process could not be launched.
    async fn spawn_locked(&self, lc: &mut Lifecycle, tier: Tier) -> Result<u64, BridgeState> {
        self.stop_locked(lc).await;

        let (program, args) = self.launch_command();
        let cache = self.config.cache_dir(tier);
        if let Err(e) = std::fs::create_dir_all(&cache) {
            warn!("Could not create cache dir {:?}: {}", cache, e);
        }

        let spawned = Command::new(&program)
            .args(&args)
            .arg("--tier")
            .arg(tier.as_str())
            .current_dir(&self.config.root)
            .env("PADDLE_HOME", cache.join("ocr"))
            .env("PADDLEX_HOME", cache.join("paddlex"))
            .env("HF_HOME", cache.join("hf"))
            .env("PADDLE_PDX_DISABLE_MODEL_SOURCE_CHECK", "True")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                self.attach_readers(&mut child);
                self.logs.info(format!(
                    "Bridge launched [tier: {}, pid: {:?}]",
                    tier,
                    child.id()
                ));
                lc.child = Some(child);
                lc.tier = Some(tier);
                lc.generation += 1;
                self.set_state(BridgeState::Starting);
                Ok(lc.generation)
            }
            Err(e) => {
                self.logs.error(format!(
                    "Failed to launch bridge {:?} for tier {}: {}",
                    program, tier, e
                ));
                self.set_state(BridgeState::Failing);
                Err(BridgeState::Failing)
            }
        }
    }

    /// Poll `/health` until ready, the process exits, the poll budget runs
    /// out, or a newer lifecycle transition takes over.
    async fn await_ready(&self, generation: u64) -> BridgeState {
        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;

            {
                let mut lc = self.lifecycle.lock().await;
                if lc.generation != generation {
                    drop(lc);
                    return self.wait_settled().await;
                }
                if let Some(child) = lc.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        lc.child = None;
                        lc.tier = None;
                        self.logs
                            .error(format!("Bridge exited during startup ({})", status));
                        self.set_state(BridgeState::Failing);
                        return BridgeState::Failing;
                    }
                }
            }

            match self.probe().await {
                Some(health) if health.is_ready() => {
                    let lc = self.lifecycle.lock().await;
                    if lc.generation != generation {
                        drop(lc);
                        return self.wait_settled().await;
                    }
                    self.logs.info(format!(
                        "Bridge ready after {} health checks [tier: {}]",
                        attempt,
                        lc.tier.map(|t| t.as_str()).unwrap_or("unknown")
                    ));
                    self.set_state(BridgeState::Healthy);
                    return BridgeState::Healthy;
                }
                Some(health) => debug!("Bridge status '{}' (attempt {})", health.status, attempt),
                None => debug!("Bridge not answering yet (attempt {})", attempt),
            }
        }

        let lc = self.lifecycle.lock().await;
        if lc.generation == generation {
            self.logs.error(format!(
                "Bridge did not become ready after {} health checks",
                self.config.poll_attempts
            ));
            self.set_state(BridgeState::Failing);
        }
        self.state()
    }

    /// Wait for an in-flight start to leave `Starting`.
    async fn wait_settled(&self) -> BridgeState {
        let mut rx = self.state.subscribe();
        let ceiling = self.config.poll_interval * (self.config.poll_attempts + 1) + HEALTH_TIMEOUT;
        let settled = rx.wait_for(|s| *s != BridgeState::Starting);
        let settled = match tokio::time::timeout(ceiling, settled).await {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        };
        settled
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Bridge state: {:?} -> {:?}", previous, state);
        }
    }

    fn launch_command(&self) -> (PathBuf, Vec<String>) {
        if let Some((program, args)) = self.config.command.as_ref().and_then(|c| c.split_first()) {
            return (PathBuf::from(program), args.to_vec());
        }
        (
            self.config.venv_python(),
            vec![self.config.script.to_string_lossy().into_owned()],
        )
    }

    fn attach_readers(&self, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Source::Stdout, self.logs.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Source::Stderr, self.logs.clone())));
        }
        readers
    }
}

/// Forward a process stream into the log buffer line by line.
async fn pump<R: AsyncRead + Unpin>(reader: R, source: Source, logs: LogBuffer) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => logs.record_line(source, &String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!("Bridge {:?} reader closed: {}", source, e);
                break;
            }
        }
    }
}

/// Ask the process to exit, then force it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let signalled = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if signalled && tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Bridge kill: {}", e);
    }
}

/// Kill whatever still listens on the bridge port. Orphaned worker
/// processes can outlive the parent's termination signal.
///
/// Only listening sockets count: this server's own client connections to
/// the bridge share the port number.
async fn free_port(port: u16) {
    let own = std::process::id();
    for pid in listener_pids(port).await {
        if pid == own {
            continue;
        }
        let mut command = if cfg!(windows) {
            let mut c = Command::new("taskkill");
            c.arg("/F").arg("/PID").arg(pid.to_string());
            c
        } else {
            let mut c = Command::new("kill");
            c.arg("-9").arg(pid.to_string());
            c
        };
        let result = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(_) => debug!("Killed pid {} listening on port {}", pid, port),
            Err(e) => debug!("Port cleanup for {} (pid {}) failed: {}", port, pid, e),
        }
    }
}

async fn listener_pids(port: u16) -> Vec<u32> {
    let output = if cfg!(windows) {
        Command::new("netstat").arg("-aon").output().await
    } else {
        Command::new("lsof")
            .arg("-ti")
            .arg(format!("tcp:{}", port))
            .arg("-sTCP:LISTEN")
            .output()
            .await
    };
    match output {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            if cfg!(windows) {
                parse_netstat_listeners(&text, port)
            } else {
                parse_pid_lines(&text)
            }
        }
        Err(e) => {
            debug!("Listener lookup for port {} failed: {}", port, e);
            Vec::new()
        }
    }
}

/// `lsof -t` output: one pid per line.
fn parse_pid_lines(text: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = text.lines().filter_map(|l| l.trim().parse().ok()).collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// `netstat -aon` rows in `LISTENING` state whose local address ends in
/// `:port`. The pid is the last column.
fn parse_netstat_listeners(text: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                [proto, local, _, state, pid]
                    if proto.eq_ignore_ascii_case("tcp")
                        && local.ends_with(&suffix)
                        && *state == "LISTENING" =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
