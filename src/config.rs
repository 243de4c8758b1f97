//! Configuration management for Ratewarden.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};

use crate::error::{RatewardenError, Result};
use crate::ratelimit::RateLimitConfig;

/// Prefix of environment variables overriding file settings, e.g.
/// `RATEWARDEN__SERVER__LISTEN_ADDR=0.0.0.0:9000`.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting policy
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Whether to serve the administrative routes
    #[serde(default)]
    pub admin_enabled: bool,

    /// Separate listener for the administrative routes; keep it off the
    /// public network
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl ServerConfig {
    /// Admin listener address, if the admin routes are enabled.
    pub fn admin_listener(&self) -> Option<SocketAddr> {
        self.admin_enabled.then_some(self.admin_addr)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_enabled: false,
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9091))
}

/// Where counters are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory; only correct for a single instance.
    Memory {
        /// How often expired counters are swept
        #[serde(
            default = "default_sweep_interval",
            deserialize_with = "deserialize_duration"
        )]
        sweep_interval: Duration,
    },
    /// A Redis server shared by every instance.
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
        url: String,
        /// Upper bound on each store command
        #[serde(
            default = "default_response_timeout",
            deserialize_with = "deserialize_duration"
        )]
        response_timeout: Duration,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            sweep_interval: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(250)
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `RATEWARDEN__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatewardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.admin_enabled && self.server.admin_addr == self.server.listen_addr {
            return Err(RatewardenError::Config(
                "server.admin_addr must differ from server.listen_addr".to_string(),
            ));
        }

        if let StorageConfig::Redis {
            url,
            response_timeout,
        } = &self.storage
        {
            if url.is_empty() {
                return Err(RatewardenError::Config(
                    "storage.url must not be empty".to_string(),
                ));
            }
            if response_timeout.is_zero() {
                return Err(RatewardenError::Config(
                    "storage.response_timeout must be greater than zero".to_string(),
                ));
            }
        }
        self.rate_limiting.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, FailureMode};
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(matches!(config.storage, StorageConfig::Memory { .. }));
        assert_eq!(config.logging.level, "info");
        assert!(config.rate_limiting.enabled);
        assert!(!config.server.admin_enabled);
        assert_eq!(config.server.admin_listener(), None);
    }

    #[test]
    fn test_admin_listener() {
        let config = ServiceConfig::from_yaml(
            r#"
server:
  listen_addr: 0.0.0.0:8080
  admin_enabled: true
"#,
        )
        .unwrap();
        let admin = config.server.admin_listener().unwrap();
        assert!(admin.ip().is_loopback());
        assert_ne!(admin, config.server.listen_addr);
    }

    #[test]
    fn test_rejects_shared_admin_listener() {
        let result = ServiceConfig::from_yaml(
            r#"
server:
  listen_addr: 127.0.0.1:8080
  admin_enabled: true
  admin_addr: 127.0.0.1:8080
"#,
        );
        assert!(matches!(result, Err(RatewardenError::Config(_))));
    }

    #[test]
    fn test_from_yaml() {
        let config = ServiceConfig::from_yaml(
            r#"
server:
  listen_addr: 0.0.0.0:9000
storage:
  type: redis
  url: redis://cache:6379/0
  response_timeout: 100ms
logging:
  level: debug
  json: true
rate_limiting:
  algorithm: fixed_window
  failure_mode: deny
  ip:
    limit: 60
    window: 1m
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        match &config.storage {
            StorageConfig::Redis {
                url,
                response_timeout,
            } => {
                assert_eq!(url, "redis://cache:6379/0");
                assert_eq!(*response_timeout, Duration::from_millis(100));
            }
            other => panic!("expected redis storage, got {other:?}"),
        }
        assert!(config.logging.json);
        assert_eq!(config.rate_limiting.algorithm, Algorithm::FixedWindow);
        assert_eq!(config.rate_limiting.failure_mode, FailureMode::Deny);
        assert_eq!(config.rate_limiting.ip.limit, 60);
    }

    #[test]
    fn test_memory_storage_sweep_interval() {
        let config = ServiceConfig::from_yaml(
            r#"
storage:
  type: memory
  sweep_interval: 5s
"#,
        )
        .unwrap();
        match config.storage {
            StorageConfig::Memory { sweep_interval } => {
                assert_eq!(sweep_interval, Duration::from_secs(5))
            }
            other => panic!("expected memory storage, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_invalid_rate_limits() {
        let result = ServiceConfig::from_yaml(
            r#"
rate_limiting:
  user:
    limit: 10
    window: 0s
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "rate_limiting:\n  key_prefix: forum\n  ip:\n    limit: 42\n    window: 30s"
        )
        .unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rate_limiting.key_prefix, "forum");
        assert_eq!(config.rate_limiting.ip.limit, 42);
        assert_eq!(config.rate_limiting.ip.window, Duration::from_secs(30));
    }
}
