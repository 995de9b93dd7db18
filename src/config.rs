//! Broker configuration: a TOML file layered with environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commands::DeviceInfo;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    /// Path of the things database file.
    #[serde(alias = "thingsDb")]
    pub things_db: PathBuf,
    /// Identifier of the gateway device this broker serves.
    #[serde(alias = "deviceId")]
    pub device_id: String,
    /// Tenant used in device-to-cloud topics for virtual devices.
    #[serde(alias = "tenantId")]
    pub tenant_id: String,
    /// Create unknown things transparently on first command.
    #[serde(alias = "autoProvisioningEnabled")]
    pub auto_provisioning_enabled: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            things_db: PathBuf::from("things.db"),
            device_id: String::new(),
            tenant_id: String::new(),
            auto_provisioning_enabled: true,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Optional log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("log/local-digital-twins.log")),
        }
    }
}

impl TwinConfig {
    /// Load the configuration file (if present) and apply environment
    /// overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TWINS_THINGS_DB") {
            if !value.is_empty() {
                self.things_db = PathBuf::from(value);
            }
        }
        if let Ok(value) = std::env::var("TWINS_DEVICE_ID") {
            if !value.is_empty() {
                self.device_id = value;
            }
        }
        if let Ok(value) = std::env::var("TWINS_TENANT_ID") {
            if !value.is_empty() {
                self.tenant_id = value;
            }
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            tenant_id: self.tenant_id.clone(),
            auto_provisioning: self.auto_provisioning_enabled,
        }
    }
}

/// Announce timeout for the hub connection parameters, from
/// `HUB_PARAMS_ANNOUNCE_TIMEOUT` (positive integer seconds), 5 s default.
pub fn hub_params_announce_timeout() -> Duration {
    let default = Duration::from_secs(5);
    match std::env::var("HUB_PARAMS_ANNOUNCE_TIMEOUT") {
        Ok(raw) => match raw.parse::<i64>() {
            Ok(seconds) if seconds > 0 => Duration::from_secs(seconds as u64),
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TwinConfig::default();
        assert_eq!(config.things_db, PathBuf::from("things.db"));
        assert!(config.auto_provisioning_enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
things_db = "/var/lib/twins/things.db"
device_id = "org.eclipse.kanto:gw"
tenant_id = "t1"
auto_provisioning_enabled = false

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = TwinConfig::load(&path).unwrap();
        assert_eq!(config.device_id, "org.eclipse.kanto:gw");
        assert_eq!(config.tenant_id, "t1");
        assert!(!config.auto_provisioning_enabled);
        assert_eq!(config.logging.level, "debug");

        let device = config.device_info();
        assert_eq!(device.device_id, "org.eclipse.kanto:gw");
        assert!(!device.auto_provisioning);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TwinConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.things_db, PathBuf::from("things.db"));
    }

    #[test]
    fn rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "things_db = [broken").unwrap();
        assert!(TwinConfig::load(&path).is_err());
    }
}
