//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use reqsock_core::{Options, PeerLostPolicy};
use serde::Deserialize;

/// Socket configuration. File: ~/.config/reqsock/config.toml or /etc/reqsock/config.toml.
/// Env overrides: REQSOCK_SEND_TIMEOUT_MS, REQSOCK_RECEIVE_TIMEOUT_MS, REQSOCK_SEND_HWM,
/// REQSOCK_RECEIVE_HWM, REQSOCK_CONNECT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Max wait for a peer / queue room on send. None blocks forever; 0 does not wait.
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,
    /// Max wait for the reply on receive. None blocks forever; 0 does not wait.
    #[serde(default)]
    pub receive_timeout_ms: Option<u64>,
    /// Per-peer outbound queue bound in messages (default 1000).
    #[serde(default = "default_hwm")]
    pub send_hwm: usize,
    /// Inbound messages queued on the socket before peers are held back (default 1000).
    #[serde(default = "default_hwm")]
    pub receive_hwm: usize,
    #[serde(default)]
    pub relaxed: bool,
    #[serde(default)]
    pub correlate: bool,
    #[serde(default)]
    pub on_peer_lost: PeerLostPolicy,
    /// TCP endpoints (`host:port`) the CLI connects to.
    #[serde(default)]
    pub connect: Vec<String>,
}

fn default_hwm() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_timeout_ms: None,
            receive_timeout_ms: None,
            send_hwm: default_hwm(),
            receive_hwm: default_hwm(),
            relaxed: false,
            correlate: false,
            on_peer_lost: PeerLostPolicy::default(),
            connect: Vec::new(),
        }
    }
}

impl Config {
    pub fn options(&self) -> Options {
        Options {
            relaxed: self.relaxed,
            correlate: self.correlate,
            on_peer_lost: self.on_peer_lost,
        }
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }
}

/// Parse a TOML config document.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("REQSOCK_SEND_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.send_timeout_ms = Some(ms);
        }
    }
    if let Some(s) = var("REQSOCK_RECEIVE_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.receive_timeout_ms = Some(ms);
        }
    }
    if let Some(s) = var("REQSOCK_SEND_HWM") {
        if let Ok(n) = s.parse::<usize>() {
            c.send_hwm = n;
        }
    }
    if let Some(s) = var("REQSOCK_RECEIVE_HWM") {
        if let Ok(n) = s.parse::<usize>() {
            c.receive_hwm = n;
        }
    }
    if let Some(s) = var("REQSOCK_CONNECT") {
        c.connect = s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect();
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/reqsock/config.toml"));
    }
    out.push(PathBuf::from("/etc/reqsock/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| parse(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
