//! Link configuration - JSON file in PRINTLINK_HOME

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use printlink_proto::{display_uuid, parse_uuid, printer};

use crate::error::ConfigError;
use crate::platform::RequestDeviceOptions;
use crate::session::SessionConfig;

pub const CONFIG_FILE: &str = "config.json";

/// On-disk configuration. Identifiers may be short aliases (`0x18f0`) or full
/// 128-bit UUID strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub service: String,
    pub characteristic: String,
    /// Pick the first device whose name or address contains this
    pub name_filter: Option<String>,
    /// Arm notifications after every successful connect
    pub notifications: bool,
    pub auto_reconnect: bool,
    pub connect_timeout_ms: u64,
    pub scan_duration_ms: u64,
    pub max_write_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: display_uuid(printer::SERVICE),
            characteristic: display_uuid(printer::CHARACTERISTIC),
            name_filter: None,
            notifications: false,
            auto_reconnect: true,
            connect_timeout_ms: 10_000,
            scan_duration_ms: 5_000,
            max_write_len: printer::MAX_ATTRIBUTE_LEN,
        }
    }
}

/// PRINTLINK_HOME, or `~/.printlink`
pub fn printlink_home() -> Option<PathBuf> {
    match std::env::var("PRINTLINK_HOME") {
        Ok(home) => Some(PathBuf::from(home)),
        Err(_) => dirs::home_dir().map(|home| home.join(".printlink")),
    }
}

pub fn default_path() -> Option<PathBuf> {
    printlink_home().map(|home| home.join(CONFIG_FILE))
}

impl LinkConfig {
    /// Read the config at `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// [`LinkConfig::load`] from [`default_path`]
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |source: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(std::io::Error::other).map_err(write_error)?;
        fs::write(path, data).map_err(write_error)
    }

    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let service = parse_uuid(&self.service).map_err(|source| ConfigError::Identifier {
            field: "service",
            source,
        })?;
        let characteristic =
            parse_uuid(&self.characteristic).map_err(|source| ConfigError::Identifier {
                field: "characteristic",
                source,
            })?;
        if self.max_write_len == 0 || self.max_write_len > printer::MAX_ATTRIBUTE_LEN {
            return Err(ConfigError::WriteLen {
                max: printer::MAX_ATTRIBUTE_LEN,
                got: self.max_write_len,
            });
        }

        Ok(ResolvedConfig {
            service,
            characteristic,
            name_filter: self.name_filter.clone().filter(|f| !f.is_empty()),
            notifications: self.notifications,
            auto_reconnect: self.auto_reconnect,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            scan_duration: Duration::from_millis(self.scan_duration_ms),
            max_write_len: self.max_write_len,
        })
    }
}

/// Validated configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub name_filter: Option<String>,
    pub notifications: bool,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub scan_duration: Duration,
    pub max_write_len: usize,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            service: session.service,
            characteristic: session.characteristic,
            name_filter: None,
            notifications: false,
            auto_reconnect: session.auto_reconnect,
            connect_timeout: session.connect_timeout,
            scan_duration: Duration::from_secs(5),
            max_write_len: printer::MAX_ATTRIBUTE_LEN,
        }
    }
}

impl ResolvedConfig {
    pub fn request_options(&self) -> RequestDeviceOptions {
        RequestDeviceOptions {
            accept_all_devices: self.name_filter.is_none(),
            optional_services: vec![self.service],
            name_filter: self.name_filter.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service: self.service,
            characteristic: self.characteristic,
            connect_timeout: self.connect_timeout,
            auto_reconnect: self.auto_reconnect,
        }
    }
}
