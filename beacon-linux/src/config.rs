//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use beacon_core::CoreConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/beacond/config.toml or /etc/beacond/config.toml.
/// Env overrides: BEACOND_STORE_PATH, BEACOND_ISSUER_URL, BEACOND_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// JSON file holding saved beacons.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Short-URL issuer endpoint. Ephemeral URL beacons fail without one.
    #[serde(default)]
    pub issuer_url: Option<String>,
    #[serde(default)]
    pub issuer_api_key: Option<String>,
    /// Log filter used when BEACON_LOG is unset (default "info").
    #[serde(default = "default_log")]
    pub log: String,
    /// Eddystone-URL beacons created and started when nothing is active on boot.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_store_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/beacond/beacons.json"),
        None => PathBuf::from("/var/lib/beacond/beacons.json"),
    }
}

fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            issuer_url: None,
            issuer_api_key: None,
            log: default_log(),
            urls: Vec::new(),
            core: CoreConfig::default(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
/// A config file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BEACOND_STORE_PATH") {
        c.store_path = PathBuf::from(s);
    }
    if let Some(s) = var("BEACOND_ISSUER_URL") {
        c.issuer_url = (!s.is_empty()).then_some(s);
    }
    if let Some(s) = var("BEACOND_LOG") {
        c.log = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/beacond/config.toml"));
    }
    out.push(PathBuf::from("/etc/beacond/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Config {
        core: c.core.normalized(),
        ..c
    })
}
