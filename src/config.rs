//! Configuration parsing and structures

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::backend::ftp::FtpSettings;
use crate::backend::samba::SambaSettings;
use crate::backend::ConnectionParams;
use crate::env::substitute_params;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-protocol settings and default parameters
    #[serde(default)]
    pub backends: BackendDefaults,

    /// Named remote mounts
    pub mounts: Vec<RawMountConfig>,
}

/// Top-level backend section
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendDefaults {
    pub ftp: Option<FtpSection>,
    pub samba: Option<SambaSection>,
}

/// FTP adapter settings plus parameters every FTP mount inherits
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FtpSection {
    #[serde(default)]
    pub settings: FtpSettings,

    #[serde(default)]
    pub params: ConnectionParams,
}

/// SMB adapter settings plus parameters every samba mount inherits
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SambaSection {
    #[serde(default)]
    pub settings: SambaSettings,

    #[serde(default)]
    pub params: ConnectionParams,
}

/// Backend type of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ftp,
    Samba,
}

impl BackendKind {
    /// Registry identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Ftp => "ftp",
            BackendKind::Samba => "samba",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Name the CLI refers to the mount by
    pub name: String,

    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Connection parameters (override backend defaults)
    #[serde(default)]
    pub params: ConnectionParams,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,

    pub ftp: FtpSettings,

    pub samba: SambaSettings,

    /// Mounts with inherited and substituted parameters
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mount configuration (resolved)
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub name: String,
    pub kind: BackendKind,
    pub params: ConnectionParams,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount parameters over
    /// backend defaults and substituting environment references
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            backends,
            mounts,
        } = self;
        let ftp = backends.ftp.unwrap_or_default();
        let samba = backends.samba.unwrap_or_default();

        let mut resolved = Vec::with_capacity(mounts.len());
        for raw in mounts {
            let defaults = match raw.kind {
                BackendKind::Ftp => &ftp.params,
                BackendKind::Samba => &samba.params,
            };
            let params = Self::merge_params(defaults, raw.params);
            let params = substitute_params(params).map_err(|e| {
                ConfigError::ValidationError(format!("Mount {:?}: {}", raw.name, e))
            })?;
            resolved.push(MountConfig {
                name: raw.name,
                kind: raw.kind,
                params,
            });
        }

        Ok(Config {
            logging,
            ftp: ftp.settings,
            samba: samba.settings,
            mounts: resolved,
        })
    }

    fn merge_params(defaults: &ConnectionParams, mount: ConnectionParams) -> ConnectionParams {
        let mut merged = defaults.clone();
        for (key, value) in mount.iter() {
            merged.set(key.clone(), value.clone());
        }
        merged
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for mount in &self.mounts {
            if mount.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Mount name cannot be empty".to_string(),
                ));
            }
            if !names.insert(mount.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount name: {:?}",
                    mount.name
                )));
            }
        }

        for (kind, capacity) in [
            (BackendKind::Ftp, self.ftp.cache.capacity),
            (BackendKind::Samba, self.samba.cache.capacity),
        ] {
            if capacity == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} cache capacity must be at least 1",
                    kind
                )));
            }
        }

        Ok(())
    }

    pub fn mount(&self, name: &str) -> Option<&MountConfig> {
        self.mounts.iter().find(|m| m.name == name)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
