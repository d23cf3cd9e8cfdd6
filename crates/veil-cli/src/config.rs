//! Configuration file support for the VEIL CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// VEIL CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host to connect to (client modes)
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to serve on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Set TCP_NODELAY on connections
    #[serde(default = "default_true")]
    pub no_delay: bool,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cipher workers per session (0 = inline crypto)
    #[serde(default)]
    pub crypto_parallelism: usize,
    /// Modulus bits for the acceptor keypair
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4433
}

fn default_true() -> bool {
    true
}

fn default_key_bits() -> usize {
    2048
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            no_delay: default_true(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            crypto_parallelism: 0,
            key_bits: default_key_bits(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| format!("read {path:?}: {e}"))?;
        toml::from_str(&text).map_err(|e| format!("parse {path:?}: {e}"))
    }
}
