use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::event::FAILED_LOGON_EVENT_ID;

/// Current layout version of the configuration file
pub const CONFIG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unsupported configuration version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the smbguard daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Layout version; files without one are treated as version 0
    #[serde(default)]
    pub version: u32,
    pub scan: ScanConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    pub firewall: FirewallConfig,
    pub storage: StorageConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub alerting: AlertConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
}

/// Scan scheduling and ban threshold configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Minutes between automatic scans
    pub interval_minutes: u32,
    /// Accepted failed attempts before an address is banned
    pub threshold: u32,
    /// Floor applied to `threshold` when deciding automatic bans
    #[serde(default = "default_minimum_attempts")]
    pub minimum_attempts: u32,
    /// Window after a ban during which repeat crossings are logged as recent
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Name of the event log to read
    pub log_name: String,
    /// Event id of failed-login records
    pub event_id: u32,
}

/// Addresses, networks and domains that are never tracked
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Exact addresses or CIDR blocks
    #[serde(default)]
    pub ips: Vec<String>,
    /// Domain names resolved once per scan refresh
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Netsh,
    Iptables,
    None,
}

impl FirewallBackend {
    /// Backend matching the host platform
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            FirewallBackend::Netsh
        } else {
            FirewallBackend::Iptables
        }
    }
}

/// Firewall enforcement configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Enable/disable installing block rules
    pub ban_ips: bool,
    pub backend: FirewallBackend,
    /// Block rules are named `<rule_prefix><address>`
    pub rule_prefix: String,
}

/// Ledger database and snapshot locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Flat JSON dump of all records, rewritten after every scan
    pub snapshot_path: Option<PathBuf>,
}

/// Event source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Type of event source: "jsonl" or "auth_log"
    pub source_type: String,
    pub file_path: PathBuf,
}

/// Ban audit output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (if format is not "console")
    pub file_path: Option<PathBuf>,
}

/// Ban notification configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    /// "POST" (default) or "PUT"
    pub method: Option<String>,
    pub headers: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoIpConfig {
    /// Path to a GeoLite2-City database
    pub database_path: Option<PathBuf>,
}

fn default_minimum_attempts() -> u32 {
    10
}

fn default_cooldown_seconds() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: CONFIG_VERSION,
            scan: ScanConfig {
                interval_minutes: 5,
                threshold: 10,
                minimum_attempts: default_minimum_attempts(),
                cooldown_seconds: default_cooldown_seconds(),
                log_name: "Security".to_string(),
                event_id: FAILED_LOGON_EVENT_ID,
            },
            whitelist: WhitelistConfig {
                ips: vec!["127.0.0.1".to_string(), "192.168.0.0/24".to_string()],
                domains: Vec::new(),
            },
            firewall: FirewallConfig {
                ban_ips: true,
                backend: FirewallBackend::platform_default(),
                rule_prefix: "SMB_block_".to_string(),
            },
            storage: StorageConfig {
                database_path: PathBuf::from("smbguard.db"),
                snapshot_path: Some(PathBuf::from("banned_ips.json")),
            },
            input: InputConfig {
                source_type: "jsonl".to_string(),
                file_path: PathBuf::from("security_events.jsonl"),
            },
            output: OutputConfig {
                format: "jsonl".to_string(),
                file_path: Some(PathBuf::from("ban_audit.jsonl")),
            },
            alerting: AlertConfig::default(),
            geoip: GeoIpConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, migrating older layouts
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        let config = config.migrate()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Bring an older configuration layout up to `CONFIG_VERSION`
    pub fn migrate(mut self) -> Result<Self, ConfigError> {
        if self.version > CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.version));
        }

        if self.version == 0 {
            // Version 0 files used a bare prefix without the trailing separator
            if !self.firewall.rule_prefix.is_empty() && !self.firewall.rule_prefix.ends_with('_') {
                self.firewall.rule_prefix.push('_');
            }
            if self.scan.minimum_attempts == 0 {
                self.scan.minimum_attempts = default_minimum_attempts();
            }
            log::info!("Migrated configuration from version 0 to {}", CONFIG_VERSION);
            self.version = CONFIG_VERSION;
        }

        Ok(self)
    }

    /// Check value ranges and whitelist syntax
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.threshold == 0 {
            return Err(ConfigError::Invalid("scan.threshold must be at least 1".into()));
        }
        if self.scan.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "scan.interval_minutes must be at least 1".into(),
            ));
        }
        for entry in &self.whitelist.ips {
            let entry = entry.trim();
            let valid = entry.parse::<IpAddr>().is_ok()
                || entry.parse::<ipnetwork::IpNetwork>().is_ok();
            if !valid {
                return Err(ConfigError::Invalid(format!(
                    "whitelist entry '{}' is neither an address nor a CIDR block",
                    entry
                )));
            }
        }
        match self.input.source_type.as_str() {
            "jsonl" | "auth_log" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown input.source_type '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}
