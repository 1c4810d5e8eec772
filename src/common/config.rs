//! Configuration file handling
//!
//! A TOML file can seed a [`Registry`]'s options. Every value goes through
//! the registry's validating setters, so a bad url in the file is reported
//! the same way as a bad url set from code.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};
use crate::registry::Registry;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Implicit wait deadline in milliseconds
    #[serde(default)]
    pub default_max_wait_time_ms: Option<u64>,

    /// Base url prepended to every visited path
    #[serde(default)]
    pub app_host: Option<String>,

    /// Base url for drivers that run without a server
    #[serde(default)]
    pub default_host: Option<String>,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Server settings
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Registered server to use
    #[serde(default)]
    pub name: Option<String>,

    /// Interface to bind
    #[serde(default)]
    pub host: Option<String>,

    /// Preferred port
    #[serde(default)]
    pub port: Option<u16>,

    /// Share servers between sessions
    #[serde(default)]
    pub reuse: Option<bool>,

    /// Start servers for drivers that need one
    #[serde(default)]
    pub run: Option<bool>,

    /// Seconds a server may take to accept connections
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::from_path(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from `path`
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Push every set value into `registry`
    ///
    /// Urls and the server name are validated before anything is written,
    /// so a rejected file leaves the registry untouched.
    pub fn apply(&self, registry: &Registry) -> Result<()> {
        let probe = Registry::empty();
        if let Some(app_host) = &self.app_host {
            probe.set_app_host(Some(app_host.as_str()))?;
        }
        if let Some(default_host) = &self.default_host {
            probe.set_default_host(default_host)?;
        }
        if let Some(host) = &self.server.host {
            probe.set_server_host(host)?;
        }
        if let Some(name) = &self.server.name {
            registry.server_factory(name)?;
        }

        if let Some(app_host) = &self.app_host {
            registry.set_app_host(Some(app_host.as_str()))?;
        }
        if let Some(default_host) = &self.default_host {
            registry.set_default_host(default_host)?;
        }
        if let Some(ms) = self.default_max_wait_time_ms {
            registry.set_default_max_wait_time(Duration::from_millis(ms));
        }
        if let Some(name) = &self.server.name {
            registry.set_server(name.as_str())?;
        }
        if let Some(host) = &self.server.host {
            registry.set_server_host(host)?;
        }
        if let Some(port) = self.server.port {
            registry.set_server_port(Some(port));
        }
        if let Some(reuse) = self.server.reuse {
            registry.set_reuse_server(reuse);
        }
        if let Some(run) = self.server.run {
            registry.set_run_server(run);
        }
        if let Some(secs) = self.server.startup_timeout_secs {
            registry.set_server_startup_timeout(Duration::from_secs(secs));
        }

        tracing::debug!(config = ?self, "Applied configuration");
        Ok(())
    }
}
