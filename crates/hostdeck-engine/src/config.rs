//! Engine configuration: TOML file + CLI overrides.

use crate::bridge::BridgeConfig;
use crate::session::SessionDefaults;
use crate::telemetry::{AdapterKind, SamplerConfig};
use hostdeck_core::{DeckError, DeckResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Shell command line; unset means the user's login shell.
    pub shell: Option<String>,
    /// Starting directory; unset means the home directory.
    pub cwd: Option<String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            rows: default_rows(),
            cols: default_cols(),
            max_sessions: default_max_sessions(),
            term: default_term(),
            env: BTreeMap::new(),
        }
    }
}

/// `[telemetry]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_stall_factor")]
    pub stall_factor: u32,
    #[serde(default = "default_adapters")]
    pub adapters: Vec<AdapterKind>,
    #[serde(default = "default_process_limit")]
    pub process_limit: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            stall_factor: default_stall_factor(),
            adapters: default_adapters(),
            process_limit: default_process_limit(),
        }
    }
}

/// `[bridge]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_max_sessions() -> usize {
    32
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_interval_ms() -> u64 {
    1500
}
fn default_stall_factor() -> u32 {
    4
}
fn default_adapters() -> Vec<AdapterKind> {
    AdapterKind::ALL.to_vec()
}
fn default_process_limit() -> usize {
    10
}
fn default_capacity() -> usize {
    1024
}
fn default_inbound_capacity() -> usize {
    256
}

/// Values given on the command line; each wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub interval_ms: Option<u64>,
    pub disabled_adapters: Vec<AdapterKind>,
}

/// Resolved engine configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session: SessionDefaults,
    pub term: String,
    pub sampler: SamplerConfig,
    pub adapters: Vec<AdapterKind>,
    pub process_limit: usize,
    pub bridge: BridgeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), &ConfigOverrides::default())
    }
}

impl EngineConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> DeckResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(&path.to_string_lossy());
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    pub fn parse(content: &str) -> DeckResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| DeckError::Config(format!("config parse error: {e}")))
    }

    fn resolve(file: ConfigFile, overrides: &ConfigOverrides) -> Self {
        let shell = overrides.shell.clone().or(file.session.shell);
        let cwd = overrides
            .cwd
            .clone()
            .or(file.session.cwd)
            .map(|c| expand_tilde(&c));
        let interval_ms = overrides.interval_ms.unwrap_or(file.telemetry.interval_ms);

        let adapters = file
            .telemetry
            .adapters
            .into_iter()
            .filter(|kind| !overrides.disabled_adapters.contains(kind))
            .collect();

        Self {
            session: SessionDefaults {
                shell,
                cwd,
                rows: file.session.rows.max(1),
                cols: file.session.cols.max(1),
                env: file.session.env,
                max_sessions: file.session.max_sessions,
            },
            term: file.session.term,
            sampler: SamplerConfig::new(
                Duration::from_millis(interval_ms),
                file.telemetry.stall_factor,
            ),
            adapters,
            process_limit: file.telemetry.process_limit,
            bridge: BridgeConfig {
                capacity: file.bridge.capacity.max(1),
                inbound_capacity: file.bridge.inbound_capacity.max(1),
            },
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if s == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
