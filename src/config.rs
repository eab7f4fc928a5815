//! `hatch.toml` loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::buildkit::{default_daemon_command, BuildKitConfig, RetryPolicy, DEFAULT_LISTEN_PORT};
use crate::sandbox::{ContainerProviderConfig, ResourceLimits};

/// Config file looked up in the working directory
pub const CONFIG_FILE: &str = "hatch.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub buildkit: BuildKitSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sandbox defaults applied by the container provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image used when a create request names none
    #[serde(default = "default_image")]
    pub image: String,

    /// Command run by `attach` when none is given
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// Command keeping an idle sandbox alive
    #[serde(default = "default_keepalive")]
    pub keepalive_command: Vec<String>,

    /// Working directory inside the sandbox
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Host IP published ports bind to
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    /// Memory limit (e.g., "8g", "512m"); "0" is unlimited
    #[serde(default = "default_zero")]
    pub memory: String,

    /// CPU limit (e.g., "1.5"); "0" is unlimited
    #[serde(default = "default_zero")]
    pub cpus: String,

    /// Writable layer size (e.g., "10g"); "0" is unlimited
    #[serde(default = "default_zero")]
    pub disk: String,

    /// Maximum sandbox lifetime in minutes; 0 is unlimited
    #[serde(default)]
    pub max_lifetime_minutes: u64,

    /// Grace period before a stop turns into a kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            shell: default_shell(),
            keepalive_command: default_keepalive(),
            working_dir: default_working_dir(),
            host_ip: default_host_ip(),
            memory: default_zero(),
            cpus: default_zero(),
            disk: default_zero(),
            max_lifetime_minutes: 0,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Per-project BuildKit accelerators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildKitSection {
    /// Provision accelerators for sandboxes created with a project id
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Accelerator image; defaults to the sandbox image
    #[serde(default)]
    pub image: Option<String>,

    /// Where the cache volume is mounted
    #[serde(default = "default_cache_mount")]
    pub cache_mount: String,

    /// Daemon entrypoint; defaults to buildkitd on `listen_port`
    #[serde(default)]
    pub daemon_command: Option<Vec<String>>,

    /// Port the daemon listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Open-file limit for the daemon
    #[serde(default = "default_nofile_limit")]
    pub nofile_limit: u64,

    /// Retries for transient engine failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff unit between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for BuildKitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            image: None,
            cache_mount: default_cache_mount(),
            daemon_command: None,
            listen_port: default_listen_port(),
            nofile_limit: default_nofile_limit(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Log output settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "text" or "json"
    #[serde(default)]
    pub format: LogFormat,

    /// Also write logs to this file (appended)
    #[serde(default)]
    pub file: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "hatch-sandbox:latest".to_string()
}

fn default_shell() -> Vec<String> {
    vec!["/bin/bash".to_string(), "-l".to_string()]
}

fn default_keepalive() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_zero() -> String {
    "0".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_cache_mount() -> String {
    "/var/lib/buildkit".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_nofile_limit() -> u64 {
    1_048_576
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_file(&config_path)
    }

    /// Load configuration from an explicit path, which must exist
    pub fn load_file(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.stop_timeout_secs)
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.buildkit.retry_attempts,
            backoff: Duration::from_millis(self.buildkit.retry_backoff_ms),
        }
    }

    /// Settings for the accelerator orchestrator, or `None` when disabled
    pub fn buildkit_config(&self) -> Option<BuildKitConfig> {
        if !self.buildkit.enabled {
            return None;
        }
        let section = &self.buildkit;
        Some(BuildKitConfig {
            image: section
                .image
                .clone()
                .unwrap_or_else(|| self.sandbox.image.clone()),
            daemon_command: section
                .daemon_command
                .clone()
                .unwrap_or_else(|| default_daemon_command(section.listen_port)),
            listen_port: section.listen_port,
            cache_mount: section.cache_mount.clone(),
            nofile_limit: section.nofile_limit,
            retry: self.retry(),
        })
    }

    /// Settings for the container provider
    pub fn provider_config(&self) -> Result<ContainerProviderConfig> {
        let sandbox = &self.sandbox;
        let cpus: f64 = sandbox
            .cpus
            .parse()
            .with_context(|| format!("Invalid cpu limit: {}", sandbox.cpus))?;

        Ok(ContainerProviderConfig {
            default_image: sandbox.image.clone(),
            keepalive_command: sandbox.keepalive_command.clone(),
            shell: sandbox.shell.clone(),
            working_dir: Some(sandbox.working_dir.clone()).filter(|d| !d.is_empty()),
            host_ip: sandbox.host_ip.clone(),
            default_resources: ResourceLimits {
                memory_bytes: parse_memory_limit(&sandbox.memory)?,
                cpus,
                disk_bytes: parse_memory_limit(&sandbox.disk)?,
                max_lifetime: Duration::from_secs(sandbox.max_lifetime_minutes * 60),
            },
            stop_timeout: self.stop_timeout(),
            retry: self.retry(),
            buildkit: self.buildkit_config(),
            ..Default::default()
        })
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub fn parse_memory_limit(limit: &str) -> Result<u64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: u64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: u64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        let kilos: u64 = num.parse().context("Invalid memory limit")?;
        Ok(kilos * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.buildkit.enabled);
        assert_eq!(config.sandbox.image, "hatch-sandbox:latest");
        assert_eq!(config.sandbox.stop_timeout_secs, 10);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sandbox]
image = "registry.local/sandbox:v2"
memory = "8g"
cpus = "1.5"

[buildkit]
enabled = true
listen_port = 4321
retry_attempts = 5

[logging]
format = "json"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.image, "registry.local/sandbox:v2");
        assert_eq!(config.buildkit.listen_port, 4321);
        assert_eq!(config.logging.format, LogFormat::Json);

        let provider = config.provider_config().unwrap();
        assert_eq!(provider.default_resources.memory_bytes, 8 * 1024 * 1024 * 1024);
        assert!((provider.default_resources.cpus - 1.5).abs() < f64::EPSILON);
        assert_eq!(provider.retry.attempts, 5);

        let buildkit = provider.buildkit.unwrap();
        assert_eq!(buildkit.image, "registry.local/sandbox:v2");
        assert_eq!(buildkit.listen_port, 4321);
        assert!(buildkit.daemon_command.contains(&"tcp://0.0.0.0:4321".to_string()));
    }

    #[test]
    fn test_buildkit_disabled() {
        let config: Config = toml::from_str("[buildkit]\nenabled = false\n").unwrap();
        assert!(config.buildkit_config().is_none());
        assert!(config.provider_config().unwrap().buildkit.is_none());
    }

    #[test]
    fn test_buildkit_image_defaults_to_sandbox_image() {
        let config: Config = toml::from_str("[sandbox]\nimage = \"dev:1\"\n").unwrap();
        assert_eq!(config.buildkit_config().unwrap().image, "dev:1");
    }

    #[test]
    fn test_buildkit_image_override() {
        let toml = r#"
[buildkit]
image = "moby/buildkit:v0.13"
daemon_command = ["buildkitd", "--addr", "tcp://0.0.0.0:1234"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let buildkit = config.buildkit_config().unwrap();
        assert_eq!(buildkit.image, "moby/buildkit:v0.13");
        assert_eq!(buildkit.daemon_command.len(), 3);
    }

    #[test]
    fn test_invalid_limits_are_rejected() {
        let config: Config = toml::from_str("[sandbox]\nmemory = \"lots\"\n").unwrap();
        assert!(config.provider_config().is_err());

        let config: Config = toml::from_str("[sandbox]\ncpus = \"many\"\n").unwrap();
        assert!(config.provider_config().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.image, "hatch-sandbox:latest");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[sandbox\nimage = ").unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_file_requires_existing_path() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("8g").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("0").unwrap(), 0);
        assert!(parse_memory_limit("-1g").is_err());
    }
}
