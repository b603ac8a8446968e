//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use objsh_core::SharerConfig;

/// Daemon configuration. File: ~/.config/objsh/config.toml or /etc/objsh/config.toml.
/// Env overrides: OBJSH_LISTEN_HOST, OBJSH_LISTEN_PORT, OBJSH_PEERS,
/// OBJSH_CALL_TIMEOUT_MS, OBJSH_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interface to listen on (default 127.0.0.1; "*" for all).
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// TCP port (default 55555; 0 picks an ephemeral port).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host announced to peers instead of the bound address.
    #[serde(default)]
    pub advertise_host: Option<String>,
    /// Peers to dial at startup, `host:port` or `tcp://host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Synchronous call timeout in milliseconds (default 5000).
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Handshake timeout in milliseconds (default 20000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Period of the `heartbeat` signal on the echo object; 0 disables it.
    #[serde(default)]
    pub heartbeat_ms: u64,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}
fn default_listen_port() -> u16 {
    55555
}
fn default_call_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_log() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            advertise_host: None,
            peers: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_ms: 0,
            log: default_log(),
        }
    }
}

impl Config {
    pub fn sharer_config(&self) -> SharerConfig {
        SharerConfig {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            advertise_host: self.advertise_host.clone(),
            ..SharerConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("OBJSH_LISTEN_HOST") {
        c.listen_host = s;
    }
    if let Some(s) = var("OBJSH_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("OBJSH_PEERS") {
        c.peers = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(s) = var("OBJSH_CALL_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.call_timeout_ms = ms;
        }
    }
    if let Some(s) = var("OBJSH_LOG") {
        c.log = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/objsh/config.toml"));
    }
    out.push(PathBuf::from("/etc/objsh/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => eprintln!("ignoring {}: {}", p.display(), e),
                }
            }
            break;
        }
    }
    None
}
