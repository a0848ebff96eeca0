//! Configuration file parser for snirelay.
//!
//! A small YAML file with `global`, `https`, `http`, `console` and
//! `client` sections; every field has a default so an empty file is a
//! valid configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub https: HttpsConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub console: ConsoleConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Base directory for relative paths (default: the executable's
    /// directory).
    pub root: Option<PathBuf>,

    /// Source IP for outbound dials.
    pub outip: Option<String>,

    /// Log destination; stderr when unset.
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    /// Comma-separated listen addresses for the TLS splicer.
    #[serde(default = "default_https_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Comma-separated listen addresses for the plain-HTTP forwarder.
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Admin endpoint listen address.
    #[serde(default = "default_console_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Path to the allow-list JSON file.
    pub rules: Option<PathBuf>,

    /// Admit every host, ignoring the allow-list.
    #[serde(default)]
    pub passthrough: bool,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            listen: default_https_listen(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            listen: default_console_listen(),
        }
    }
}

fn default_https_listen() -> String {
    ":443".to_string()
}

fn default_http_listen() -> String {
    ":80".to_string()
}

fn default_console_listen() -> String {
    ":2080".to_string()
}

impl Config {
    /// Load configuration from an explicit path, or from the first
    /// candidate found in the standard search locations.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::find_config() {
                Some(p) => p,
                None => bail!("config file not found: no snirelay.yaml in the current or executable directory"),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Search the current directory, then the executable's directory.
    fn find_config() -> Option<PathBuf> {
        let candidates = ["snirelay.yaml", "snirelay.yml"];
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }
        if let Some(dir) = exe_dir() {
            for name in &candidates {
                let path = dir.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Base directory for relative paths.
    pub fn root(&self) -> PathBuf {
        self.global
            .root
            .clone()
            .or_else(exe_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a possibly-relative path against the configured root.
    pub fn file_location(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root().join(path)
        }
    }

    /// The validated outbound source IP, if one is configured. A value
    /// that does not parse is a startup error.
    pub fn outip(&self) -> Result<Option<IpAddr>> {
        match &self.global.outip {
            None => Ok(None),
            Some(raw) => {
                let ip = raw
                    .parse()
                    .with_context(|| format!("invalid outgoing IP {raw:?}"))?;
                Ok(Some(ip))
            }
        }
    }
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

/// Split a comma-separated listen string into its entries; empty entries
/// are dropped, so `listen: ""` disables the listener.
pub fn listen_addrs(listen: &str) -> Vec<String> {
    listen
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Go-style `:443` listen strings have no host part; bind on all
/// interfaces in that case.
pub fn normalize_listen(listen: &str) -> String {
    if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    }
}
