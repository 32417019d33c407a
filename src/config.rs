// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default window for a new listener to see its first secure handshake.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 6000;

/// Default number of listeners after which idle ones are swept.
pub const DEFAULT_MAX_LISTENERS: usize = 220;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Milliseconds a freshly bound listener waits for a secure handshake
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Listener count that triggers the capacity sweep
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
    #[serde(default)]
    pub ca: CaSubject,
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_max_listeners() -> usize {
    DEFAULT_MAX_LISTENERS
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_listeners: default_max_listeners(),
            ca: CaSubject::default(),
        }
    }
}

/// Subject and issuer attributes of the root certificate, plus the optional
/// key to import instead of generating one.
///
/// Omitted attributes are encoded as empty values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaSubject {
    pub common_name: String,
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    /// PKCS#8 PEM private key for the root
    #[serde(skip_serializing)]
    pub key_pem: Option<String>,
    /// File holding `key_pem`, read by [`PoolConfig::load`]
    pub key_path: Option<PathBuf>,
}

impl CaSubject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }
}

impl PoolConfig {
    /// Load config from a TOML file, falling back to defaults when it is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if config.ca.key_pem.is_none() {
            if let Some(key_path) = &config.ca.key_path {
                let key_pem = std::fs::read_to_string(key_path).map_err(|e| Error::ReadFile {
                    path: key_path.clone(),
                    source: e,
                })?;
                config.ca.key_pem = Some(key_pem);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(Error::Config("idle_timeout_ms must be at least 1".into()));
        }
        if self.max_listeners == 0 {
            return Err(Error::Config("max_listeners must be at least 1".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        crate::fs::atomic_write(path, content.as_bytes())
    }
}
