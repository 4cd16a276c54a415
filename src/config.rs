//! Startup configuration for the two binaries.
//!
//! Both configs can be loaded from a TOML file or assembled from CLI
//! arguments; `validate()` catches the mistakes that would otherwise surface
//! as confusing runtime errors.

use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server startup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,

    /// Directory holding the canonical file tree.
    pub root_dir: PathBuf,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.port == 0 {
            errors.push("port must be non-zero".to_owned());
        }
        if self.root_dir.as_os_str().is_empty() {
            errors.push("root-dir must not be empty".to_owned());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Proxy startup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    /// Host of the authoritative server.
    pub server_host: String,

    /// Port of the authoritative server.
    pub server_port: u16,

    /// Local directory holding cached file versions.
    pub cache_root: PathBuf,

    /// Cache capacity; accepts human-friendly values like "512mb".
    pub cache_capacity: ByteSize,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&std::fs::read_to_string(path)?)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.server_host.is_empty() {
            errors.push("server-host must not be empty".to_owned());
        }
        if self.server_port == 0 {
            errors.push("server-port must be non-zero".to_owned());
        }
        if self.cache_root.as_os_str().is_empty() {
            errors.push("cache-root must not be empty".to_owned());
        }
        if self.cache_capacity.as_u64() == 0 {
            errors.push("cache-capacity must be non-zero".to_owned());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
