//! Configuration module for the Sandcell orchestrator
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with SANDCELL__ prefix)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::ARCHIVE_EXTENSION;
use crate::container::SessionSettings;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Force JSON log output even on a terminal
    #[serde(default)]
    pub log_json: bool,

    /// Container runtime and image settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// RPC front-end settings
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Container runtime and image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Directory scanned for image definitions
    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    /// Extension marking a file as an image definition
    #[serde(default = "default_definition_extension")]
    pub definition_extension: String,

    /// Docker/Podman socket path; local defaults when unset
    #[serde(default)]
    pub socket: Option<String>,

    /// Request timeout for the runtime client
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Grace period before a stopped container is killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// How long an unclosed container keeps running before exiting on its own
    #[serde(default = "default_container_lifetime")]
    pub container_lifetime_secs: u64,
}

/// RPC front-end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Capacity of the log sink created for each RPC session
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Address the exporter listens on
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("./images")
}

fn default_definition_extension() -> String {
    "dockerfile".to_string()
}

fn default_connect_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_container_lifetime() -> u64 {
    3600
}

fn default_sink_capacity() -> usize {
    64
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            images_dir: default_images_dir(),
            definition_extension: default_definition_extension(),
            socket: None,
            connect_timeout_secs: default_connect_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            container_lifetime_secs: default_container_lifetime(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            sink_capacity: default_sink_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            docker: DockerConfig::default(),
            rpc: RpcConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl DockerConfig {
    /// Settings handed to every session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            container_lifetime: Duration::from_secs(self.container_lifetime_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/sandcell").required(false))
            .add_source(config::File::with_name("/etc/sandcell/config").required(false))
            .add_source(
                config::Environment::with_prefix("SANDCELL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let extension = self.docker.definition_extension.trim_start_matches('.');
        if extension.is_empty() {
            anyhow::bail!("Image definition extension cannot be empty");
        }
        if extension == ARCHIVE_EXTENSION {
            anyhow::bail!("Image definition extension cannot be '{}'", ARCHIVE_EXTENSION);
        }

        if self.docker.container_lifetime_secs == 0 {
            anyhow::bail!("Container lifetime cannot be 0");
        }

        if self.rpc.sink_capacity == 0 {
            anyhow::bail!("Log sink capacity cannot be 0");
        }

        if self.metrics.enabled {
            self.metrics
                .listen
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("Invalid metrics listen address: {}", self.metrics.listen))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.docker.definition_extension, "dockerfile");
        assert_eq!(config.docker.stop_timeout_secs, 10);
        assert!(config.docker.socket.is_none());
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.docker.definition_extension = ".tar".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rpc.sink_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.metrics.enabled = true;
        config.metrics.listen = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_settings() {
        let docker = DockerConfig {
            stop_timeout_secs: 3,
            container_lifetime_secs: 60,
            ..DockerConfig::default()
        };
        let settings = docker.session_settings();
        assert_eq!(settings.stop_timeout, Duration::from_secs(3));
        assert_eq!(settings.container_lifetime, Duration::from_secs(60));
    }
}
