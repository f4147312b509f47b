// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Engine configuration and loading.
//!
//! Configuration is read from YAML or TOML, then `${VAR}` / `${VAR:default}`
//! placeholders are resolved and `TRAP_UA_*` environment overrides applied:
//!
//! ```text
//! TRAP_UA_SESSION_TIMEOUT=2m
//! TRAP_UA_OPERATION_TIMEOUT=10s
//! TRAP_UA_EVICTION_INTERVAL=5s
//! TRAP_UA_MAX_DISCOVERY_ATTEMPTS=5
//! TRAP_UA_AUTO_ACCEPT_UNTRUSTED_CERTIFICATES=true
//! ```
//!
//! # Example
//!
//! ```yaml
//! session:
//!   session_timeout: 5m
//!   operation_timeout: 15s
//! pool:
//!   eviction_interval: 10s
//! discovery:
//!   max_discovery_attempts: 3
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::retry::RetryConfig;
use crate::error::{ConfigurationError, OpcUaError, OpcUaResult};
use crate::logging::LoggingConfig;
use crate::types::{humantime_serde, SubscriptionConfig, DEFAULT_OPC_TCP_PORT};

/// Default environment variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "TRAP_UA";

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Session behavior.
    #[serde(default)]
    pub session: SessionConfig,

    /// Session pool behavior.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Endpoint discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Subscription defaults.
    #[serde(default)]
    pub subscription: SubscriptionDefaults,

    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> OpcUaResult<()> {
        non_zero("session.session_timeout", self.session.session_timeout)?;
        non_zero("session.operation_timeout", self.session.operation_timeout)?;
        non_zero("session.keep_alive_interval", self.session.keep_alive_interval)?;
        non_zero("pool.eviction_interval", self.pool.eviction_interval)?;
        non_zero("discovery.hop_timeout", self.discovery.hop_timeout)?;

        if self.discovery.max_discovery_attempts == 0 {
            return Err(invalid("discovery.max_discovery_attempts", "must be at least 1"));
        }
        if self.session.reconnect.max_attempts == 0 {
            return Err(invalid("session.reconnect.max_attempts", "must be at least 1"));
        }
        if self.subscription.notification_channel_capacity == 0 {
            return Err(invalid(
                "subscription.notification_channel_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session without pending calls is evicted.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Default per-call timeout.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Keep-alive period while the session is idle.
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,

    /// Reconnect policy when opening the transport.
    #[serde(default)]
    pub reconnect: RetryConfig,

    /// Trust unknown server certificates.
    #[serde(default)]
    pub auto_accept_untrusted_certificates: bool,
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: default_session_timeout(),
            operation_timeout: default_operation_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            reconnect: RetryConfig::default(),
            auto_accept_untrusted_certificates: false,
        }
    }
}

/// Session pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Period of the inactive-session sweep.
    #[serde(default = "default_eviction_interval", with = "humantime_serde")]
    pub eviction_interval: Duration,
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            eviction_interval: default_eviction_interval(),
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Attempts per discovery hop.
    #[serde(default = "default_max_discovery_attempts")]
    pub max_discovery_attempts: u32,

    /// Timeout of one discovery hop attempt.
    #[serde(default = "default_hop_timeout", with = "humantime_serde")]
    pub hop_timeout: Duration,

    /// Port assumed when a discovery URL has none.
    #[serde(default = "default_port")]
    pub default_port: u16,
}

fn default_max_discovery_attempts() -> u32 {
    3
}

fn default_hop_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_port() -> u16 {
    DEFAULT_OPC_TCP_PORT
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_discovery_attempts: default_max_discovery_attempts(),
            hop_timeout: default_hop_timeout(),
            default_port: default_port(),
        }
    }
}

/// Subscription defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    /// Default server-side parameters.
    #[serde(default)]
    pub config: SubscriptionConfig,

    /// Capacity of the channel carrying publish messages from the transport.
    #[serde(default = "default_channel_capacity")]
    pub notification_channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            config: SubscriptionConfig::default(),
            notification_channel_capacity: default_channel_capacity(),
        }
    }
}

fn non_zero(field: &str, value: Duration) -> OpcUaResult<()> {
    if value.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> OpcUaError {
    OpcUaError::configuration(ConfigurationError::invalid_value(field, reason))
}

// =============================================================================
// ConfigFormat
// =============================================================================

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format.
    Yaml,
    /// TOML format.
    Toml,
}

impl ConfigFormat {
    /// Determines the format from a file path.
    pub fn from_path(path: &Path) -> OpcUaResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            other => Err(invalid(
                "format",
                &format!("unsupported extension '{}'", other.unwrap_or("(none)")),
            )),
        }
    }
}

// =============================================================================
// ConfigLoader
// =============================================================================

/// Loads [`EngineConfig`] from files or strings.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_prefix: String,
    resolve_env_vars: bool,
}

impl ConfigLoader {
    /// Creates a loader with the default `TRAP_UA` prefix.
    pub fn new() -> Self {
        Self {
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            resolve_env_vars: true,
        }
    }

    /// Sets the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Enables or disables placeholder resolution and env overrides.
    pub fn with_env_vars(mut self, enabled: bool) -> Self {
        self.resolve_env_vars = enabled;
        self
    }

    /// Loads configuration from a file.
    pub fn load(&self, path: impl AsRef<Path>) -> OpcUaResult<EngineConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading engine configuration");

        let content = fs::read_to_string(path).map_err(|source| {
            OpcUaError::configuration(ConfigurationError::Io {
                path: path.display().to_string(),
                source,
            })
        })?;
        let format = ConfigFormat::from_path(path)?;

        let mut config = self
            .parse(&content, format)
            .map_err(|(message, line)| {
                OpcUaError::configuration(ConfigurationError::parse(
                    Some(path.display().to_string()),
                    message,
                    line,
                ))
            })?;

        self.finish(&mut config)?;
        debug!(?config, "Engine configuration loaded");
        Ok(config)
    }

    /// Loads configuration from a string.
    pub fn load_from_str(&self, content: &str, format: ConfigFormat) -> OpcUaResult<EngineConfig> {
        let mut config = self.parse(content, format).map_err(|(message, line)| {
            OpcUaError::configuration(ConfigurationError::parse(None, message, line))
        })?;
        self.finish(&mut config)?;
        Ok(config)
    }

    fn parse(
        &self,
        content: &str,
        format: ConfigFormat,
    ) -> Result<EngineConfig, (String, Option<usize>)> {
        let content = if self.resolve_env_vars {
            resolve_env_placeholders(content)
        } else {
            content.to_string()
        };

        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&content).map_err(|e| {
                let line = e.location().map(|l| l.line());
                (e.to_string(), line)
            }),
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| (e.to_string(), None)),
        }
    }

    fn finish(&self, config: &mut EngineConfig) -> OpcUaResult<()> {
        if self.resolve_env_vars {
            self.apply_env_overrides(config)?;
        }
        config.validate()
    }

    /// Applies `<PREFIX>_*` overrides.
    fn apply_env_overrides(&self, config: &mut EngineConfig) -> OpcUaResult<()> {
        if let Some(value) = self.env_duration("SESSION_TIMEOUT")? {
            config.session.session_timeout = value;
        }
        if let Some(value) = self.env_duration("OPERATION_TIMEOUT")? {
            config.session.operation_timeout = value;
        }
        if let Some(value) = self.env_duration("KEEP_ALIVE_INTERVAL")? {
            config.session.keep_alive_interval = value;
        }
        if let Some(value) = self.env_duration("EVICTION_INTERVAL")? {
            config.pool.eviction_interval = value;
        }
        if let Some(value) = self.env_var("MAX_DISCOVERY_ATTEMPTS") {
            config.discovery.max_discovery_attempts = value.parse().map_err(|_| {
                invalid(&self.env_name("MAX_DISCOVERY_ATTEMPTS"), "expected a number")
            })?;
        }
        if let Some(value) = self.env_var("AUTO_ACCEPT_UNTRUSTED_CERTIFICATES") {
            config.session.auto_accept_untrusted_certificates = parse_bool(&value);
        }
        if let Some(value) = self.env_var("LOG_LEVEL") {
            config.logging.level = value;
        }
        if let Some(value) = self.env_var("LOG_FORMAT") {
            config.logging.format = value.parse()?;
        }
        Ok(())
    }

    fn env_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.env_prefix, suffix)
    }

    fn env_var(&self, suffix: &str) -> Option<String> {
        env::var(self.env_name(suffix)).ok()
    }

    fn env_duration(&self, suffix: &str) -> OpcUaResult<Option<Duration>> {
        self.env_var(suffix)
            .map(|value| {
                humantime::parse_duration(&value).map_err(|e| {
                    invalid(&self.env_name(suffix), &format!("expected a duration: {e}"))
                })
            })
            .transpose()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves `${VAR}` and `${VAR:default}` placeholders.
///
/// Unknown variables without a default are left in place.
fn resolve_env_placeholders(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };

        let body = &after[..end];
        let (name, default) = match body.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };

        match (env::var(name), default) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => {
                warn!(variable = name, "Environment variable not found");
                result.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}

/// Parses a string to bool.
fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "enabled"
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.session.session_timeout, Duration::from_secs(300));
        assert_eq!(config.session.operation_timeout, Duration::from_secs(15));
        assert_eq!(config.pool.eviction_interval, Duration::from_secs(10));
        assert_eq!(config.discovery.max_discovery_attempts, 3);
        assert_eq!(config.discovery.default_port, 4840);
        assert!(!config.session.auto_accept_untrusted_certificates);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let yaml = r#"
session:
  session_timeout: 1m
  operation_timeout: 5s
  auto_accept_untrusted_certificates: true
pool:
  eviction_interval: 2s
subscription:
  config:
    publishing_interval: 250ms
"#;
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = ConfigLoader::new()
            .with_env_prefix("TRAP_UA_TEST_YAML")
            .load(file.path())
            .unwrap();

        assert_eq!(config.session.session_timeout, Duration::from_secs(60));
        assert_eq!(config.session.operation_timeout, Duration::from_secs(5));
        assert!(config.session.auto_accept_untrusted_certificates);
        assert_eq!(config.pool.eviction_interval, Duration::from_secs(2));
        assert_eq!(
            config.subscription.config.publishing_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.discovery.max_discovery_attempts, 3);
    }

    #[test]
    fn test_load_toml_str() {
        let toml = r#"
[discovery]
max_discovery_attempts = 5
hop_timeout = "3s"
"#;
        let config = ConfigLoader::new()
            .with_env_vars(false)
            .load_from_str(toml, ConfigFormat::Toml)
            .unwrap();
        assert_eq!(config.discovery.max_discovery_attempts, 5);
        assert_eq!(config.discovery.hop_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_env_override() {
        env::set_var("TRAP_UA_TEST_ENV_SESSION_TIMEOUT", "90s");
        env::set_var("TRAP_UA_TEST_ENV_AUTO_ACCEPT_UNTRUSTED_CERTIFICATES", "yes");

        let config = ConfigLoader::new()
            .with_env_prefix("TRAP_UA_TEST_ENV")
            .load_from_str("{}", ConfigFormat::Yaml)
            .unwrap();

        assert_eq!(config.session.session_timeout, Duration::from_secs(90));
        assert!(config.session.auto_accept_untrusted_certificates);

        env::remove_var("TRAP_UA_TEST_ENV_SESSION_TIMEOUT");
        env::remove_var("TRAP_UA_TEST_ENV_AUTO_ACCEPT_UNTRUSTED_CERTIFICATES");
    }

    #[test]
    fn test_invalid_env_override() {
        env::set_var("TRAP_UA_TEST_BAD_MAX_DISCOVERY_ATTEMPTS", "many");
        let result = ConfigLoader::new()
            .with_env_prefix("TRAP_UA_TEST_BAD")
            .load_from_str("{}", ConfigFormat::Yaml);
        env::remove_var("TRAP_UA_TEST_BAD_MAX_DISCOVERY_ATTEMPTS");

        assert!(matches!(
            result,
            Err(OpcUaError::Configuration(ConfigurationError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_validation_rejects_zero() {
        let result = ConfigLoader::new()
            .with_env_vars(false)
            .load_from_str("discovery:\n  max_discovery_attempts: 0\n", ConfigFormat::Yaml);
        assert!(result.is_err());

        let result = ConfigLoader::new()
            .with_env_vars(false)
            .load_from_str("session:\n  operation_timeout: 0s\n", ConfigFormat::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = ConfigLoader::new()
            .with_env_vars(false)
            .load_from_str("session:\n  session_timeout: [\n", ConfigFormat::Yaml)
            .unwrap_err();
        assert!(matches!(
            err,
            OpcUaError::Configuration(ConfigurationError::Parse { .. })
        ));
    }

    #[test]
    fn test_placeholders() {
        env::set_var("TRAP_UA_TEST_PLACEHOLDER", "7s");
        assert_eq!(
            resolve_env_placeholders("a: ${TRAP_UA_TEST_PLACEHOLDER}"),
            "a: 7s"
        );
        env::remove_var("TRAP_UA_TEST_PLACEHOLDER");

        assert_eq!(
            resolve_env_placeholders("a: ${TRAP_UA_TEST_MISSING:3s}"),
            "a: 3s"
        );
        assert_eq!(
            resolve_env_placeholders("a: ${TRAP_UA_TEST_MISSING}"),
            "a: ${TRAP_UA_TEST_MISSING}"
        );
        assert_eq!(resolve_env_placeholders("a: ${open"), "a: ${open");
    }

    #[test]
    fn test_config_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("engine.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("engine.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert!(ConfigFormat::from_path(Path::new("engine.ini")).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("off"));
    }
}
