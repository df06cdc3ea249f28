//! Gatelink CLI Configuration Management
//!
//! This module provides configuration loading for the Gatelink CLI
//! application. It supports loading configuration from:
//! - Configuration files (gatelink.toml)
//! - Environment variables (GATELINK_*)
//! - Command line arguments
//!
//! The configuration system uses figment for flexible, layered configuration
//! loading with proper priority ordering: CLI args > env vars > config file
//! > defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use gatelink_core::{ClientSettings, RetryPolicy};
use gatelink_runtime::EngineConfig;

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the Gatelink CLI application
///
/// This struct consolidates everything the CLI needs:
/// - Gateway connection settings (URL, identity, scopes)
/// - Protocol timing knobs fed into the engine
/// - CLI-specific settings (logging, output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Gateway connection configuration
    pub gateway: GatewayConfig,

    /// Protocol timing configuration
    pub timing: TimingConfig,

    /// CLI-specific configuration
    pub cli: CliConfig,

    /// State persistence configuration
    pub storage: StorageConfig,
}

/// Gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Websocket URL of the gateway (ws:// or wss://)
    pub url: String,

    /// Bearer token presented during the handshake, if the gateway
    /// requires one up front
    pub auth_token: Option<String>,

    /// Agent session to attach to
    pub agent_id: String,

    /// Role requested during the handshake
    pub role: String,

    /// Scopes requested during the handshake
    pub scopes: Vec<String>,

    /// Display name advertised to the gateway
    pub display_name: Option<String>,
}

/// Protocol timing knobs
///
/// These map onto the engine configuration. The defaults match the gateway's
/// published expectations; override them only against a gateway configured to
/// match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long to wait for an auth challenge before sending the
    /// handshake unsigned-nonce (in milliseconds)
    pub challenge_window_ms: u64,

    /// Socket dial timeout (in seconds)
    pub connect_timeout_secs: u64,

    /// Per-request response timeout (in seconds)
    pub request_timeout_secs: u64,

    /// Heartbeat ping interval (in seconds)
    pub ping_interval_secs: u64,

    /// Silence tolerated before the link is declared dead, as a
    /// multiple of the ping interval
    pub liveness_multiplier: u32,

    /// Reconnect backoff floor (in milliseconds)
    pub retry_base_ms: u64,

    /// Reconnect backoff ceiling (in milliseconds)
    pub retry_cap_ms: u64,

    /// Random jitter fraction added to reconnect delays (0.0 to 1.0)
    pub retry_jitter: f64,
}

/// CLI-specific configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Print raw gateway events while streaming
    pub show_events: bool,
}

/// State persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for identity, settings and the offline queue
    /// (defaults to ~/.gatelink)
    pub data_dir: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for GatewayConfig {
    fn default() -> Self {
        let settings = ClientSettings::default();
        Self {
            url: settings.gateway_url,
            auth_token: None,
            agent_id: settings.agent_id,
            role: settings.role,
            scopes: settings.scopes,
            display_name: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            challenge_window_ms: 1000,
            connect_timeout_secs: 10,
            request_timeout_secs: 15,
            ping_interval_secs: 30,
            liveness_multiplier: 2,
            retry_base_ms: 1000,
            retry_cap_ms: 30_000,
            retry_jitter: 0.3,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            show_events: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            timing: TimingConfig::default(),
            cli: CliConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration with the standard priority order:
    /// 1. Command line arguments (highest priority)
    /// 2. Environment variables
    /// 3. Configuration file (gatelink.toml)
    /// 4. Default values (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Self::base_figment()?;
        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()));

        let config: AppConfig = figment.extract().map_err(|e| {
            ConfigError::Loading(format!(
                "Failed to load from {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with command line overrides
    pub fn load_with_overrides(
        gateway_url: Option<String>,
        agent_id: Option<String>,
        verbose: Option<bool>,
        data_dir: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment()?;

        if let Some(url) = gateway_url {
            figment = figment.merge(("gateway.url", url));
        }
        if let Some(agent) = agent_id {
            figment = figment.merge(("gateway.agent_id", agent));
        }
        if let Some(v) = verbose {
            figment = figment.merge(("cli.verbose", v));
        }
        if let Some(dir) = data_dir {
            figment = figment.merge(("storage.data_dir", dir));
        }

        let config: AppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load with overrides: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn base_figment() -> Result<Figment, ConfigError> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("gatelink.toml"))
            .merge(Toml::file(Self::default_config_path()?))
            .merge(Env::prefixed("GATELINK_").split("__")))
    }

    /// Get the default configuration file path (~/.gatelink/config.toml)
    fn default_config_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or_else(|| {
            ConfigError::Environment("Could not determine home directory".to_string())
        })?;
        Ok(home.join(".gatelink").join("config.toml"))
    }

    /// Resolve the data directory, falling back to ~/.gatelink
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        let home = dirs::home_dir().ok_or_else(|| {
            ConfigError::Environment("Could not determine home directory".to_string())
        })?;
        Ok(home.join(".gatelink"))
    }

    /// Save configuration to a specific file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::FileSystem(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), toml_string)
            .map_err(|e| ConfigError::FileSystem(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Gateway fields are checked by the settings type the engine consumes
        self.client_settings()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.timing.ping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "Ping interval must be greater than 0".to_string(),
            ));
        }

        if self.timing.liveness_multiplier == 0 {
            return Err(ConfigError::Validation(
                "Liveness multiplier must be greater than 0".to_string(),
            ));
        }

        if self.timing.retry_base_ms == 0 || self.timing.retry_cap_ms < self.timing.retry_base_ms {
            return Err(ConfigError::Validation(
                "Retry backoff must have a nonzero base no larger than the cap".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.timing.retry_jitter) {
            return Err(ConfigError::Validation(format!(
                "Retry jitter must be between 0.0 and 1.0, got {}",
                self.timing.retry_jitter
            )));
        }

        Ok(())
    }

    /// Build the protocol client settings from this configuration
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            gateway_url: self.gateway.url.clone(),
            auth_token: self.gateway.auth_token.clone(),
            agent_id: self.gateway.agent_id.clone(),
            role: self.gateway.role.clone(),
            scopes: self.gateway.scopes.clone(),
            display_name: self.gateway.display_name.clone(),
            ..ClientSettings::default()
        }
    }

    /// Build the engine configuration from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            challenge_window: Duration::from_millis(self.timing.challenge_window_ms),
            connect_timeout: Duration::from_secs(self.timing.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.timing.request_timeout_secs),
            ping_interval: Duration::from_secs(self.timing.ping_interval_secs),
            liveness_multiplier: self.timing.liveness_multiplier,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.timing.retry_base_ms),
                max_delay: Duration::from_millis(self.timing.retry_cap_ms),
                jitter: self.timing.retry_jitter,
                ..RetryPolicy::default()
            },
        }
    }

    /// Create example configuration file content
    pub fn example_config() -> String {
        let example = AppConfig {
            gateway: GatewayConfig {
                url: "wss://gateway.example.net/session".to_string(),
                auth_token: None,
                agent_id: "main".to_string(),
                role: "operator".to_string(),
                scopes: vec!["chat".to_string()],
                display_name: Some("workstation".to_string()),
            },
            ..Default::default()
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
