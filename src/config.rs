//! Service configuration
//!
//! Handles parsing and management of offsign.toml configuration files. The
//! bridge itself only consumes already-parsed values (`BridgeConfig`); this
//! module is the file-facing side, including the one evaluation of the
//! offset expression at load time.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{BridgeConfig, BridgeError, CallContract, LibrarySpec, OffsetExpr};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Configuration incomplete: {0}")]
    Incomplete(String),

    #[error(transparent)]
    Offset(#[from] BridgeError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching offsign.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsignConfig {
    /// Bind address for the API-layer collaborator.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for the API-layer collaborator.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bridge settings.
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// The `[bridge]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Ordered library candidates, names or paths.
    #[serde(default)]
    pub libs: Vec<String>,

    /// Offset expression, evaluated once at load time.
    #[serde(default)]
    pub offset: String,

    /// Bound on waiting for the foreign-call lock, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Named constants available to the offset expression.
    #[serde(default)]
    pub constants: HashMap<String, i64>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for OffsignConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bridge: BridgeSection::default(),
        }
    }
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            libs: Vec::new(),
            offset: String::new(),
            call_timeout_ms: default_call_timeout_ms(),
            constants: HashMap::new(),
        }
    }
}

impl OffsignConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: OffsignConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given
    /// directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("offsign.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Err(ConfigError::NotFound("offsign.toml".to_string()));
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Evaluate the offset expression and produce the already-parsed config
    /// the bridge consumes. The expression is evaluated exactly once here;
    /// the resulting value is immutable for the process lifetime.
    pub fn to_bridge_config(&self) -> ConfigResult<BridgeConfig> {
        if self.bridge.libs.is_empty() {
            return Err(ConfigError::Incomplete(
                "bridge.libs must list at least one library".to_string(),
            ));
        }
        if self.bridge.offset.trim().is_empty() {
            return Err(ConfigError::Incomplete(
                "bridge.offset must be set before the service can start".to_string(),
            ));
        }

        let offset = OffsetExpr::parse(&self.bridge.offset)?.eval(&self.bridge.constants)?;
        let libs = self
            .bridge
            .libs
            .iter()
            .map(|id| LibrarySpec::new(id.clone()))
            .collect();

        Ok(BridgeConfig {
            libs,
            offset,
            contract: CallContract::default(),
            call_timeout: Duration::from_millis(self.bridge.call_timeout_ms),
        })
    }
}
