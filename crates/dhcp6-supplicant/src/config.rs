//! Configuration loading and validation for the dhcp6 supplicant.

use dhcp6::{DeviceConfig, DuidKind, Mode, RequestOption};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

// Re-export Validate trait for derive macro
#[allow(unused_imports)]
use validator::Validate as _;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub duid: DuidSettings,

    #[serde(default)]
    pub state: StateSettings,

    #[serde(default)]
    pub shutdown: ShutdownSettings,

    #[serde(default)]
    pub interfaces: Vec<InterfaceProfile>,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

/// Client DUID persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuidSettings {
    /// Where the DUID hex string lives
    pub path: PathBuf,

    /// Which DUID flavour to generate when none is stored
    #[serde(default)]
    pub kind: DuidKindSetting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuidKindSetting {
    #[default]
    Llt,
    Ll,
}

impl From<DuidKindSetting> for DuidKind {
    fn from(kind: DuidKindSetting) -> Self {
        match kind {
            DuidKindSetting::Llt => DuidKind::LinkLayerTime,
            DuidKindSetting::Ll => DuidKind::LinkLayer,
        }
    }
}

/// On-disk state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    /// Directory for per-interface lease cache records
    pub lease_cache_dir: PathBuf,
}

/// Shutdown behavior
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShutdownSettings {
    /// Release leases on exit instead of keeping them cached
    pub release_leases: bool,

    /// How long to wait for workers to drain on exit
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_grace")]
    pub grace: Duration,
}

/// One interface to run the supplicant on
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InterfaceProfile {
    #[validate(length(min = 1, max = 15))]
    pub name: String,

    #[serde(default)]
    pub mode: ModeSetting,

    #[serde(default)]
    pub rapid_commit: bool,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_request_options")]
    pub request_options: Vec<RequestOptionSetting>,

    #[serde(default)]
    pub user_class: Vec<String>,

    #[serde(default)]
    pub vendor_class: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeSetting {
    #[default]
    Managed,
    InfoOnly,
}

impl From<ModeSetting> for Mode {
    fn from(mode: ModeSetting) -> Self {
        match mode {
            ModeSetting::Managed => Mode::Managed,
            ModeSetting::InfoOnly => Mode::InfoOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestOptionSetting {
    DnsServers,
    DomainSearch,
    SntpServers,
    SipServers,
}

impl From<RequestOptionSetting> for RequestOption {
    fn from(option: RequestOptionSetting) -> Self {
        match option {
            RequestOptionSetting::DnsServers => RequestOption::DnsServers,
            RequestOptionSetting::DomainSearch => RequestOption::DomainSearch,
            RequestOptionSetting::SntpServers => RequestOption::SntpServers,
            RequestOptionSetting::SipServers => RequestOption::SipServers,
        }
    }
}

fn default_request_options() -> Vec<RequestOptionSetting> {
    vec![
        RequestOptionSetting::DnsServers,
        RequestOptionSetting::DomainSearch,
    ]
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.shutdown.validate()?;
        for profile in &self.interfaces {
            profile.validate()?;
        }
        Ok(())
    }
}

// Default implementations

impl Default for DuidSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/dhcp6/duid"),
            kind: DuidKindSetting::Llt,
        }
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            lease_cache_dir: PathBuf::from("/var/lib/dhcp6/leases"),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            release_leases: false,
            grace: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            duid: DuidSettings::default(),
            state: StateSettings::default(),
            shutdown: ShutdownSettings::default(),
            interfaces: Vec::new(),
        }
    }
}

// Custom validators

fn validate_grace(grace: &Duration) -> Result<(), ValidationError> {
    let millis = grace.as_millis();
    if millis < 100 || millis > 60_000 {
        return Err(ValidationError::new("shutdown_grace_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        config.check_interface_names()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/dhcp6/supplicant.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./dhcp6-supplicant.yaml"));

        paths
            .into_iter()
            .find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/dhcp6/supplicant.yaml"))
    }

    /// Reject duplicate interface entries
    fn check_interface_names(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for profile in &self.interfaces {
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "interface '{}' configured twice",
                    profile.name
                )));
            }
        }
        Ok(())
    }
}

impl InterfaceProfile {
    /// Convert to the core crate's device configuration
    pub fn to_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            ifname: self.name.clone(),
            mode: self.mode.into(),
            rapid_commit: self.rapid_commit,
            hostname: self.hostname.clone(),
            user_class: self.user_class.clone(),
            vendor_class: self.vendor_class.clone(),
            request_options: self
                .request_options
                .iter()
                .map(|option| (*option).into())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_yaml_parsing() {
        let yaml = r#"
logging:
  level: debug

duid:
  path: /tmp/duid
  kind: ll

state:
  lease_cache_dir: /tmp/leases

shutdown:
  release_leases: true
  grace: 2s

interfaces:
  - name: eth0
    mode: managed
    rapid_commit: true
    hostname: workstation
    request_options: [dns-servers, domain-search, sntp-servers]
  - name: eth1
    mode: info-only
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.check_interface_names().is_ok());
        assert_eq!(config.duid.kind, DuidKindSetting::Ll);
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[1].mode, ModeSetting::InfoOnly);
        assert!(config.shutdown.release_leases);
        assert_eq!(config.shutdown.grace, Duration::from_secs(2));

        let device = config.interfaces[0].to_device_config();
        assert_eq!(device.ifname, "eth0");
        assert!(device.rapid_commit);
        assert_eq!(device.hostname.as_deref(), Some("workstation"));
        assert_eq!(device.request_options.len(), 3);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
interfaces:
  - name: eth0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.interfaces[0].mode, ModeSetting::Managed);
        assert!(!config.interfaces[0].rapid_commit);
        assert_eq!(config.interfaces[0].request_options.len(), 2);
        assert_eq!(config.duid.path, PathBuf::from("/var/lib/dhcp6/duid"));
    }

    #[test]
    fn test_empty_interface_name_rejected() {
        let yaml = r#"
interfaces:
  - name: ""
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlong_interface_name_rejected() {
        let yaml = r#"
interfaces:
  - name: "averyveryverylongifname"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_interface_rejected() {
        let yaml = r#"
interfaces:
  - name: eth0
  - name: eth0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.check_interface_names().is_err());
    }

    #[test]
    fn test_unknown_request_option_rejected() {
        let yaml = r#"
interfaces:
  - name: eth0
    request_options: [carrier-pigeon]
"#;
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_grace_bounds() {
        let yaml = r#"
shutdown:
  grace: 5ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = r#"
shutdown:
  grace: 5m
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
