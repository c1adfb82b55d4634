//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/parley/config.toml or
/// /etc/parley/config.toml.
/// Env overrides: PARLEY_DISPLAY_NAME, PARLEY_DISCOVERY_PORT,
/// PARLEY_SESSION_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to nearby peers (default: the machine hostname).
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery UDP multicast port (default 45700).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 45701).
    #[serde(default = "default_session_port")]
    pub session_port: u16,
}

fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "parley".to_owned())
}
fn default_discovery_port() -> u16 {
    45700
}
fn default_session_port() -> u16 {
    45701
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            session_port: default_session_port(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("PARLEY_DISPLAY_NAME") {
        if !s.is_empty() {
            c.display_name = s;
        }
    }
    if let Ok(s) = std::env::var("PARLEY_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("PARLEY_SESSION_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.session_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/parley/config.toml"));
    }
    out.push(PathBuf::from("/etc/parley/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
