//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use ndrt_link::{SessionConfig, SubscribeTarget};
use serde::Deserialize;
use tracing::{debug, warn};

/// Daemon configuration. File: ~/.config/ndrt/monitor.toml or /etc/ndrt/monitor.toml.
/// Env overrides: NDRT_GAZE_ENDPOINT, NDRT_STATUS_ENDPOINT, NDRT_PUBLISH_ENDPOINT,
/// NDRT_DEBOUNCE_THRESHOLD, NDRT_RECONNECT_DELAY_MS, NDRT_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Poll period in milliseconds (default 16, roughly one frame at 60 Hz).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Without a `[session]` table the daemon waits 2 s between connect
    /// attempts; a table starts from the library defaults (no wait).
    #[serde(default = "default_session")]
    pub session: SessionConfig,
}

fn default_tick_ms() -> u64 {
    16
}

fn default_session() -> SessionConfig {
    SessionConfig {
        reconnect_delay_ms: 2_000,
        ..SessionConfig::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            session: default_session(),
        }
    }
}

/// Load config: default, then `explicit` or the first config file found,
/// then env vars. An explicit path must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    debug!(path = %path.display(), "config loaded");
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ndrt/monitor.toml"));
    }
    out.push(PathBuf::from("/etc/ndrt/monitor.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("ignoring config file: {:#}", e);
            None
        }
    }
}

/// Apply overrides from `var`. Unparseable numbers are ignored; an empty
/// NDRT_PUBLISH_ENDPOINT turns status publishing off.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(ep) = var("NDRT_GAZE_ENDPOINT") {
        c.session.gaze.subscribe = Some(retarget(c.session.gaze.subscribe.take(), ep));
    }
    if let Some(ep) = var("NDRT_STATUS_ENDPOINT") {
        c.session.status.subscribe = Some(retarget(c.session.status.subscribe.take(), ep));
    }
    if let Some(ep) = var("NDRT_PUBLISH_ENDPOINT") {
        if ep.is_empty() {
            c.session.publish_status = false;
        } else {
            c.session.publish.publish = Some(ep);
            c.session.publish_status = true;
        }
    }
    if let Some(n) = var("NDRT_DEBOUNCE_THRESHOLD").and_then(|s| s.parse::<u32>().ok()) {
        c.session.debounce_threshold = n;
    }
    if let Some(ms) = var("NDRT_RECONNECT_DELAY_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.session.reconnect_delay_ms = ms;
    }
    if let Some(ms) = var("NDRT_TICK_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.tick_ms = ms;
    }
}

// Keep Pupil Remote discovery when the configured target already uses it.
fn retarget(current: Option<SubscribeTarget>, endpoint: String) -> SubscribeTarget {
    match current {
        Some(SubscribeTarget::PupilRemote(_)) => SubscribeTarget::PupilRemote(endpoint),
        _ => SubscribeTarget::Endpoint(endpoint),
    }
}
