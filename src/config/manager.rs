//! Configuration Manager

use super::Config;
use crate::forward::{BindFailurePolicy, ForwardRule};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Guess the format from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file and apply environment overrides.
    ///
    /// Validation is left to the caller so command-line overrides can be
    /// merged first.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content, ConfigFormat::from_path(path))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Parse configuration text. Without a known format YAML is tried first,
    /// then TOML.
    pub fn parse(content: &str, format: Option<ConfigFormat>) -> Result<Config> {
        match format {
            Some(ConfigFormat::Yaml) => {
                serde_yaml::from_str(content).context("Invalid YAML configuration")
            }
            Some(ConfigFormat::Toml) => toml::from_str(content).context("Invalid TOML configuration"),
            None => match serde_yaml::from_str(content) {
                Ok(config) => Ok(config),
                Err(yaml_err) => toml::from_str(content).with_context(|| {
                    format!("Configuration is neither valid YAML ({}) nor TOML", yaml_err)
                }),
            },
        }
    }

    /// Override file values with environment variables if present
    pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
        if let Ok(host) = std::env::var("SSHFWD_SSH_HOST") {
            config.ssh.host = host;
        }

        if let Ok(port) = std::env::var("SSHFWD_SSH_PORT") {
            config.ssh.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid SSHFWD_SSH_PORT: {}", port))?;
        }

        if let Ok(user) = std::env::var("SSHFWD_SSH_USER") {
            config.ssh.user = user;
        }

        if let Ok(password) = std::env::var("SSHFWD_SSH_PASSWORD") {
            config.ssh.password = Some(password);
        }

        if let Ok(idle) = std::env::var("SSHFWD_IDLE_TIMEOUT") {
            config.engine.idle_timeout = Some(
                humantime::parse_duration(&idle)
                    .with_context(|| format!("Invalid SSHFWD_IDLE_TIMEOUT: {}", idle))?,
            );
        }

        if let Ok(level) = std::env::var("SSHFWD_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(())
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_ssh_config()
            .with_context(|| "SSH configuration validation failed")?;

        self.validate_forwards()
            .with_context(|| "Forward rule validation failed")?;

        self.validate_engine_config()
            .with_context(|| "Engine configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_ssh_config(&self) -> Result<()> {
        if self.ssh.host.trim().is_empty() {
            bail!("ssh.host must not be empty");
        }

        if self.ssh.port == 0 {
            bail!("ssh.port must be greater than 0");
        }

        if self.ssh.user.trim().is_empty() {
            bail!("ssh.user must not be empty");
        }

        if self.ssh.password.is_none() && self.ssh.identity_file.is_none() {
            bail!("either ssh.password or ssh.identity_file must be set");
        }

        if self.ssh.connect_timeout.is_zero() {
            bail!("ssh.connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_forwards(&self) -> Result<()> {
        if self.forwards.is_empty() {
            bail!("at least one forward rule must be configured");
        }

        for (i, rule) in self.forwards.iter().enumerate() {
            ForwardRule::try_from(rule).with_context(|| format!("Forward rule {} is invalid", i))?;
        }

        Ok(())
    }

    fn validate_engine_config(&self) -> Result<()> {
        if self.engine.max_sessions == Some(0) {
            bail!("engine.max_sessions must be greater than 0 when set");
        }

        if let Some(idle) = self.engine.idle_timeout {
            if idle.is_zero() {
                bail!("engine.idle_timeout must be greater than 0 when set");
            }
        }

        if self.engine.buffer_size < 1024 {
            bail!("engine.buffer_size must be at least 1024 bytes");
        }

        if self.engine.buffer_size > 1048576 {
            bail!("engine.buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Forward rules in configuration order
    pub fn rules(&self) -> Result<Vec<ForwardRule>> {
        self.forwards
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                ForwardRule::try_from(rule).with_context(|| format!("Forward rule {} is invalid", i))
            })
            .collect()
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        log_level: Option<&str>,
        on_bind_failure: Option<BindFailurePolicy>,
        max_sessions: Option<usize>,
    ) {
        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }

        if let Some(policy) = on_bind_failure {
            self.engine.on_bind_failure = policy;
        }

        if let Some(max) = max_sessions {
            self.engine.max_sessions = Some(max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const YAML: &str = r#"
ssh:
  host: jump.example.com
  user: ops
  password: secret
forwards:
  - local: 127.0.0.1:9000
    remote: 10.0.0.5:80
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = ConfigManager::parse(YAML, Some(ConfigFormat::Yaml)).unwrap();
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.ssh.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.engine.on_bind_failure, BindFailurePolicy::Abort);
        assert_eq!(config.engine.max_sessions, None);
        assert_eq!(config.engine.idle_timeout, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_unknown_format_falls_back() {
        let config = ConfigManager::parse(YAML, None).unwrap();
        assert_eq!(config.forwards.len(), 1);

        let toml = r#"
[ssh]
host = "jump.example.com"
user = "ops"
password = "secret"

[[forwards]]
local = "127.0.0.1:9000"
remote = "10.0.0.5:80"
"#;
        let config = ConfigManager::parse(toml, None).unwrap();
        assert_eq!(config.forwards[0].remote, "10.0.0.5:80");
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = ConfigManager::parse(YAML, Some(ConfigFormat::Yaml)).unwrap();
        config.ssh.password = None;
        assert!(config.validate().is_err());

        config.ssh.identity_file = Some("~/.ssh/id_ed25519".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_forwards() {
        let mut config = ConfigManager::parse(YAML, Some(ConfigFormat::Yaml)).unwrap();
        config.forwards.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_engine_limits() {
        let mut config = ConfigManager::parse(YAML, Some(ConfigFormat::Yaml)).unwrap();
        config.engine.max_sessions = Some(0);
        assert!(config.validate().is_err());

        config.engine.max_sessions = Some(8);
        config.engine.idle_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        config.engine.idle_timeout = Some(Duration::from_secs(60));
        config.engine.buffer_size = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ConfigManager::parse(YAML, Some(ConfigFormat::Yaml)).unwrap();
        config.merge_with_cli_args(Some("debug"), Some(BindFailurePolicy::Skip), Some(4));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.engine.on_bind_failure, BindFailurePolicy::Skip);
        assert_eq!(config.engine.max_sessions, Some(4));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.conf")), None);
    }
}
