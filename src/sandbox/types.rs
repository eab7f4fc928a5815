//! Sandbox entity model: identity, desired configuration, observed state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle status of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Created but never started, or start not yet attempted.
    #[default]
    Created,
    /// Running and accepting exec/attach.
    Running,
    /// Stopped by the caller.
    Stopped,
    /// The backend failed to bring the sandbox up.
    Failed,
}

impl SandboxStatus {
    /// Returns true if the sandbox is running.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SandboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown sandbox status: '{s}'")),
        }
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("Unknown protocol: '{s}'. Supported: tcp, udp")),
        }
    }
}

/// A requested port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the sandbox.
    pub container_port: u16,
    /// Fixed host port. `None` or `Some(0)` lets the backend assign one.
    #[serde(default)]
    pub host_port: Option<u16>,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// A TCP mapping with a backend-assigned host port.
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: Protocol::Tcp,
        }
    }

    /// Pins the host port.
    #[must_use]
    pub fn with_host_port(mut self, host_port: u16) -> Self {
        self.host_port = Some(host_port);
        self
    }

    /// The requested fixed host port, if any. Zero counts as "assign one".
    pub fn fixed_host_port(&self) -> Option<u16> {
        self.host_port.filter(|p| *p != 0)
    }
}

/// The realized outcome of a [`PortMapping`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPort {
    /// Port inside the sandbox.
    pub container_port: u16,
    /// Host port actually bound.
    pub host_port: u16,
    /// Host IP the port is bound on.
    pub host_ip: String,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Storage attached to a sandbox. Interpretation is backend-specific
/// (bind mount for container engines).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Host path, volume name or claim, depending on backend.
    pub source: String,
    /// Path inside the sandbox.
    pub mount_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Resource limits. Zero means unlimited for every field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    /// CPU limit in (fractional) cores.
    #[serde(default)]
    pub cpus: f64,
    /// Writable-layer size limit in bytes.
    #[serde(default)]
    pub disk_bytes: u64,
    /// Maximum lifetime of the sandbox.
    #[serde(default)]
    pub max_lifetime: Duration,
}

impl ResourceLimits {
    /// Returns true if no limit is set.
    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes == 0
            && self.cpus <= 0.0
            && self.disk_bytes == 0
            && self.max_lifetime.is_zero()
    }
}

/// Desired configuration for [`Provider::create`](crate::sandbox::Provider::create).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Image reference. Empty selects the provider's default image.
    #[serde(default)]
    pub image: String,
    /// Startup command override.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Working directory inside the sandbox.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Environment applied at creation.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Backend labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Attached storage.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Requested port mappings.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Project the sandbox belongs to. Selects the shared BuildKit
    /// accelerator and network on backends that support it.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// One sandbox, bound 1:1 to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Opaque backend identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning project, if any.
    pub project_id: Option<String>,
    /// Lifecycle status.
    pub status: SandboxStatus,
    /// Image reference.
    pub image: String,
    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,
    /// Last successful start.
    pub started_at: Option<DateTime<Utc>>,
    /// Last successful stop.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last error; set only while `status` is `Failed`.
    pub error: Option<String>,
    /// Free-form backend metadata.
    pub metadata: HashMap<String, String>,
    /// Port mappings realized at creation.
    pub ports: Vec<AssignedPort>,
    /// Environment applied at creation.
    pub env: HashMap<String, String>,
}

impl Sandbox {
    /// Builds a freshly created sandbox record.
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            project_id: None,
            status: SandboxStatus::Created,
            image: image.into(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            metadata: HashMap::new(),
            ports: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Records a successful start.
    pub fn mark_running(&mut self) {
        self.status = SandboxStatus::Running;
        self.started_at = Some(Utc::now());
        self.error = None;
    }

    /// Records a successful stop.
    pub fn mark_stopped(&mut self) {
        self.status = SandboxStatus::Stopped;
        self.stopped_at = Some(Utc::now());
    }

    /// Records a failed start.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SandboxStatus::Failed;
        self.error = Some(error.into());
    }

    /// Looks up the assigned host port for a container port.
    pub fn host_port(&self, container_port: u16, protocol: Protocol) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container_port == container_port && p.protocol == protocol)
            .map(|p| p.host_port)
    }
}

/// Options for a non-interactive command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Extra environment for the command.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Bytes forwarded to stdin before waiting for exit.
    pub stdin: Option<Vec<u8>>,
}

/// Outcome of one non-interactive command. Fully materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code reported by the backend.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// Returns true on exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Options for an interactive attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    /// Terminal rows.
    pub rows: u16,
    /// Terminal columns.
    pub cols: u16,
    /// Command to run; `None` selects the provider's shell.
    pub command: Option<Vec<String>>,
    /// Extra environment.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub working_dir: Option<String>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            command: None,
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

/// Cheap syntactic check of an image reference (`[registry/]name[:tag][@digest]`).
///
/// Resolution against a registry is left to the backend.
pub fn is_valid_image_reference(image: &str) -> bool {
    !image.is_empty()
        && !image.starts_with([':', '/', '@', '-', '.'])
        && !image.ends_with([':', '/', '@'])
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
}

/// Flattens an environment map into `KEY=VALUE` strings, sorted by key.
pub fn env_pairs(env: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_and_parse() {
        for status in [
            SandboxStatus::Created,
            SandboxStatus::Running,
            SandboxStatus::Stopped,
            SandboxStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<SandboxStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SandboxStatus>().is_err());
    }

    #[test]
    fn test_zero_host_port_means_assign() {
        assert_eq!(PortMapping::tcp(8080).fixed_host_port(), None);
        assert_eq!(PortMapping::tcp(8080).with_host_port(0).fixed_host_port(), None);
        assert_eq!(
            PortMapping::tcp(8080).with_host_port(18080).fixed_host_port(),
            Some(18080)
        );
    }

    #[test]
    fn test_sandbox_transitions() {
        let mut sandbox = Sandbox::new("c1", "s1", "img:1");
        assert_eq!(sandbox.status, SandboxStatus::Created);
        assert!(sandbox.started_at.is_none());

        sandbox.mark_failed("boom");
        assert_eq!(sandbox.status, SandboxStatus::Failed);
        assert_eq!(sandbox.error.as_deref(), Some("boom"));

        sandbox.mark_running();
        assert!(sandbox.status.is_running());
        assert!(sandbox.started_at.is_some());
        assert!(sandbox.error.is_none());

        sandbox.mark_stopped();
        assert_eq!(sandbox.status, SandboxStatus::Stopped);
        assert!(sandbox.stopped_at.is_some());
    }

    #[test]
    fn test_resource_limits_unlimited_by_default() {
        assert!(ResourceLimits::default().is_unlimited());
        let limits = ResourceLimits {
            memory_bytes: 1024,
            ..Default::default()
        };
        assert!(!limits.is_unlimited());
    }

    #[test]
    fn test_image_reference_check() {
        assert!(is_valid_image_reference("hatch-sandbox:latest"));
        assert!(is_valid_image_reference("registry.example.com:5000/team/img:v1"));
        assert!(is_valid_image_reference("img@sha256:abc123"));
        assert!(!is_valid_image_reference(""));
        assert!(!is_valid_image_reference("has space"));
        assert!(!is_valid_image_reference("trailing:"));
        assert!(!is_valid_image_reference(":tag"));
    }

    #[test]
    fn test_env_pairs_sorted() {
        let env = HashMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        assert_eq!(env_pairs(&env), vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_exec_result_helpers() {
        let result = ExecResult {
            exit_code: 0,
            stdout: b"hello".to_vec(),
            stderr: Vec::new(),
        };
        assert!(result.success());
        assert_eq!(result.stdout_lossy(), "hello");
    }
}
