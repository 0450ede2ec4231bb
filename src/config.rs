use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::dispatch::DispatchMode;
use crate::lease::LEASE_MINUTES;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_min_threads")]
    pub min_threads: usize,
    #[serde(default = "WorkerConfig::default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "WorkerConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl WorkerConfig {
    const fn default_min_threads() -> usize {
        2
    }

    const fn default_max_threads() -> usize {
        100
    }

    const fn default_idle_timeout_secs() -> u64 {
        60
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_threads: Self::default_min_threads(),
            max_threads: Self::default_max_threads(),
            idle_timeout_secs: Self::default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_enabled")]
    pub enabled: bool,
    /// Accept `//MRM:X` modules that load their code from disk.
    #[serde(default)]
    pub external_enabled: bool,
    /// Run inline modules behind an isolation boundary. External modules always are.
    #[serde(default = "EngineConfig::default_sandboxed")]
    pub sandboxed: bool,
    /// Hidden engines ignore `XMRM ...` chat commands.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "EngineConfig::default_error_to_console")]
    pub error_to_console: bool,
    #[serde(default)]
    pub god_scripts: bool,
    #[serde(default)]
    pub external_god_scripts: bool,
    #[serde(default = "EngineConfig::default_sandbox_policy")]
    pub sandbox_policy: String,
    #[serde(default = "EngineConfig::default_external_sandbox_policy")]
    pub external_sandbox_policy: String,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default = "EngineConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "EngineConfig::default_tick_budget")]
    pub tick_budget: u32,
    #[serde(default = "EngineConfig::default_lease_sweep_frames")]
    pub lease_sweep_frames: u64,
    /// Renewal quantum of every handle the engine issues.
    #[serde(default = "EngineConfig::default_lease_quantum_ms")]
    pub lease_quantum_ms: u64,
    #[serde(default = "EngineConfig::default_artifact_root")]
    pub artifact_root: PathBuf,
    #[serde(default)]
    pub event_dispatch: DispatchMode,
}

impl EngineConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_sandboxed() -> bool {
        true
    }

    const fn default_error_to_console() -> bool {
        true
    }

    fn default_sandbox_policy() -> String {
        "internet".to_string()
    }

    fn default_external_sandbox_policy() -> String {
        "everything".to_string()
    }

    const fn default_stop_timeout_ms() -> u64 {
        30_000
    }

    const fn default_tick_budget() -> u32 {
        1_000
    }

    const fn default_lease_sweep_frames() -> u64 {
        600
    }

    const fn default_lease_quantum_ms() -> u64 {
        LEASE_MINUTES * 60_000
    }

    fn default_artifact_root() -> PathBuf {
        PathBuf::from("MiniModules")
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn lease_quantum(&self) -> Duration {
        Duration::from_millis(self.lease_quantum_ms)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read minimod config {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse minimod config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("[mrm] config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            external_enabled: false,
            sandboxed: Self::default_sandboxed(),
            hidden: false,
            error_to_console: Self::default_error_to_console(),
            god_scripts: false,
            external_god_scripts: false,
            sandbox_policy: Self::default_sandbox_policy(),
            external_sandbox_policy: Self::default_external_sandbox_policy(),
            workers: WorkerConfig::default(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            tick_budget: Self::default_tick_budget(),
            lease_sweep_frames: Self::default_lease_sweep_frames(),
            lease_quantum_ms: Self::default_lease_quantum_ms(),
            artifact_root: Self::default_artifact_root(),
            event_dispatch: DispatchMode::default(),
        }
    }
}
