//! Container engine primitives.
//!
//! The container provider and the BuildKit orchestrator talk to the engine
//! only through [`ContainerEngine`], so engine-specific errors are
//! translated into [`EngineError`] in exactly one place (`docker`).

mod docker;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerEngine;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::sandbox::{AssignedPort, AttachOptions, ExecOptions, ExecResult, Protocol, Pty};

/// Label marking every resource this crate manages.
pub const LABEL_MANAGED: &str = "hatch.managed";
/// Label naming the role of a managed resource.
pub const LABEL_ROLE: &str = "hatch.role";
/// Label carrying the owning project id.
pub const LABEL_PROJECT: &str = "hatch.project";
/// Label carrying the owning session id.
pub const LABEL_SESSION: &str = "hatch.session";
/// Label carrying the creation timestamp (RFC 3339).
pub const LABEL_CREATED: &str = "hatch.created";

/// Role label values.
pub mod role {
    /// Per-session sandbox container.
    pub const SANDBOX: &str = "sandbox";
    /// Per-project BuildKit accelerator container.
    pub const BUILDKIT: &str = "buildkit";
    /// Per-project isolated network.
    pub const NETWORK: &str = "network";
}

/// Engine-level failures, already stripped of transport details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The named resource does not exist.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// A resource with that name already exists or is in use.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The image reference cannot be resolved.
    #[error("Image cannot be resolved: {image}")]
    InvalidImage { image: String },

    /// The engine refused the requested resources.
    #[error("Resource limit: {message}")]
    ResourceLimit { message: String },

    /// The engine is unreachable or failed transiently.
    #[error("Container engine unavailable: {message}")]
    Unavailable { message: String },

    /// The engine rejected the request.
    #[error("Container engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl EngineError {
    /// Creates a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a name conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Treats a missing resource as success.
pub fn ignore_not_found(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Observed state of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Engine id.
    pub id: String,
    /// Container name, without a leading slash.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Whether the main process is running.
    pub running: bool,
    /// Engine state string (`created`, `running`, `exited`, ...).
    pub state: String,
    /// Exit code of the last run, if it exited.
    pub exit_code: Option<i64>,
    /// Engine-reported error, if any.
    pub error: Option<String>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Published ports.
    pub ports: Vec<AssignedPort>,
    /// Creation time reported by the engine.
    pub created: Option<DateTime<Utc>>,
}

/// How a mount is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Host path.
    Bind,
    /// Named volume.
    Volume,
}

/// A mount in a [`ContainerSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Bind or volume.
    pub kind: MountKind,
    /// Host path or volume name.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// A published port in a [`ContainerSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Port inside the container.
    pub container_port: u16,
    /// Host port to bind.
    pub host_port: u16,
    /// Host IP to bind.
    pub host_ip: String,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command override.
    pub command: Option<Vec<String>>,
    /// `KEY=VALUE` environment.
    pub env: Vec<String>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Network to attach to instead of the default bridge.
    pub network: Option<String>,
    /// Mounts.
    pub mounts: Vec<MountSpec>,
    /// Published ports.
    pub ports: Vec<PortSpec>,
    /// Run privileged.
    pub privileged: bool,
    /// Restart unless explicitly stopped.
    pub restart_unless_stopped: bool,
    /// Raised open-file limit (soft and hard).
    pub nofile_limit: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU limit in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    /// Writable-layer size in bytes.
    pub disk_bytes: Option<u64>,
}

/// Primitives the provider and orchestrator need from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Checks the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Inspects a container by name; `Ok(None)` when absent.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Lists all containers (running or not) carrying every given label.
    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerInfo>, EngineError>;

    /// Creates a container, returning its id. Fails with `Conflict` if the
    /// name is taken.
    async fn create_container(&self, name: &str, spec: &ContainerSpec)
        -> Result<String, EngineError>;

    /// Starts a container. Starting a running container succeeds.
    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    /// Stops a container, killing it after `timeout`.
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Force-removes a container.
    async fn remove_container(&self, name: &str) -> Result<(), EngineError>;

    /// Returns true if the network exists.
    async fn network_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Creates a bridge network.
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Removes a network.
    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// Returns true if the volume exists.
    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Creates a named volume.
    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Returns true if the image is available locally.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Runs a command to completion inside a container.
    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        options: &ExecOptions,
    ) -> Result<ExecResult, EngineError>;

    /// Starts an interactive TTY process inside a container.
    async fn attach(
        &self,
        container: &str,
        command: &[String],
        options: &AttachOptions,
    ) -> Result<Pty, EngineError>;
}

/// Derives the per-id part of an engine resource name.
///
/// The readable part is [`sanitize_name`]; the hex suffix is taken from a
/// SHA-256 of the raw id, so ids that sanitize alike ("Alpha", "alpha")
/// still get distinct names.
pub fn name_fragment(raw: &str) -> String {
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    format!("{}-{}", sanitize_name(raw), &digest[..8])
}

/// Maps an arbitrary id onto the character set engines accept in names.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| matches!(c, '-' | '.' | '_'));
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
