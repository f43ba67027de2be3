//! Configuration file parsing for Gangway
//!
//! Parses `gangway.toml` configuration files using serde

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gangway/gangway.toml";

/// Load configuration from a file
///
/// A missing file yields the built-in defaults.
pub fn load(path: &Path) -> Result<GangwayConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(GangwayConfig::default()),
        Err(e) => {
            return Err(Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let config: GangwayConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GangwayConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub netlink: NetlinkConfig,

    #[serde(default)]
    pub nat: NatConfig,
}

impl GangwayConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.paths.network_dir.as_os_str().is_empty() {
            return Err(Error::ConfigValidation(
                "paths.network_dir must not be empty".into(),
            ));
        }

        if self.paths.ipam_file.as_os_str().is_empty() {
            return Err(Error::ConfigValidation(
                "paths.ipam_file must not be empty".into(),
            ));
        }

        if self.nat.iptables.trim().is_empty() {
            return Err(Error::ConfigValidation("nat.iptables must not be empty".into()));
        }

        if self.nat.timeout_secs == 0 {
            return Err(Error::ConfigValidation(
                "nat.timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// On-disk state locations
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one JSON file per network
    #[serde(default = "default_network_dir")]
    pub network_dir: PathBuf,

    /// Shared IPAM allocation table
    #[serde(default = "default_ipam_file")]
    pub ipam_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            network_dir: default_network_dir(),
            ipam_file: default_ipam_file(),
        }
    }
}

fn default_network_dir() -> PathBuf {
    PathBuf::from("/var/run/gangway/network/network")
}

fn default_ipam_file() -> PathBuf {
    PathBuf::from("/var/run/gangway/network/ipam/subnet.json")
}

/// Netlink socket settings
#[derive(Debug, Clone, Deserialize)]
pub struct NetlinkConfig {
    /// Receive deadline in milliseconds (0 = block indefinitely)
    #[serde(default = "default_netlink_timeout")]
    pub timeout_ms: u64,
}

impl NetlinkConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for NetlinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_netlink_timeout(),
        }
    }
}

fn default_netlink_timeout() -> u64 {
    5000
}

/// NAT rule installation settings
#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    #[serde(default = "default_iptables")]
    pub iptables: String,

    #[serde(default = "default_nat_timeout")]
    pub timeout_secs: u64,
}

impl NatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            iptables: default_iptables(),
            timeout_secs: default_nat_timeout(),
        }
    }
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_nat_timeout() -> u64 {
    10
}
