// OpenVPN Auth Bridge - Daemon Config Module
// Management connection, bypass list and logging settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use openvpn_auth_common::{CommonNameMode, ManagementAddr, Secret};

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub openvpn: OpenVpnConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Settings for the OpenVPN management connection
#[derive(Debug, Clone, Deserialize)]
pub struct OpenVpnConfig {
    /// Management interface address, `tcp://host:port` or `unix:///path`
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Management interface password (empty when none is configured)
    #[serde(default)]
    pub password: Secret,

    /// Push the authenticated username as auth-token user on accept
    #[serde(default = "default_auth_token_user")]
    pub auth_token_user: bool,

    /// Lifetime of the web auth URL handed to a pending client
    #[serde(default = "default_auth_pending_timeout_secs")]
    pub auth_pending_timeout_secs: u64,

    #[serde(default)]
    pub bypass: BypassConfig,

    #[serde(default)]
    pub common_name: CommonNameConfig,
}

/// Clients accepted without the OAuth2 flow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BypassConfig {
    #[serde(default)]
    pub common_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonNameConfig {
    /// `plain` or `omit`
    #[serde(default)]
    pub mode: CommonNameMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// EnvFilter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_addr() -> String {
    "unix:///run/openvpn/server.sock".to_string()
}

fn default_auth_token_user() -> bool {
    true
}

fn default_auth_pending_timeout_secs() -> u64 {
    180
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            password: Secret::default(),
            auth_token_user: default_auth_token_user(),
            auth_pending_timeout_secs: default_auth_pending_timeout_secs(),
            bypass: BypassConfig::default(),
            common_name: CommonNameConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl OpenVpnConfig {
    pub fn auth_pending_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_pending_timeout_secs)
    }

    /// Whether `common_name` skips the OAuth2 flow
    pub fn is_bypassed(&self, common_name: &str) -> bool {
        self.bypass.common_names.iter().any(|cn| cn == common_name)
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        ManagementAddr::parse(&self.openvpn.addr)
            .with_context(|| format!("Invalid openvpn.addr '{}'", self.openvpn.addr))?;

        if self.openvpn.auth_pending_timeout_secs == 0 {
            anyhow::bail!("openvpn.auth_pending_timeout_secs must be greater than zero");
        }

        Ok(())
    }

    /// Load daemon configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_path = Self::config_path()?;
                if !default_path.exists() {
                    info!("No daemon configuration found at {}, using defaults", default_path.display());
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read daemon configuration {}", config_path.display()))?;

        let config = Self::from_toml(&contents)?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("openvpn-auth-oauth2").join("daemon.toml"))
    }
}
