//! Per-project BuildKit accelerators.
//!
//! Every project gets one long-lived BuildKit daemon container, an isolated
//! bridge network its sandboxes join, and a cache volume that outlives both.
//! All three are addressed by names derived from the project id, so any
//! process can find them again without local state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::engine::{
    ignore_not_found, name_fragment, role, ContainerEngine, ContainerSpec, EngineError, MountKind,
    MountSpec, LABEL_CREATED, LABEL_MANAGED, LABEL_PROJECT, LABEL_ROLE,
};
use crate::sandbox::{OpContext, SandboxError};

/// Default BuildKit daemon port.
pub const DEFAULT_LISTEN_PORT: u16 = 1234;

/// Name of the accelerator container for a project.
pub fn container_name(project_id: &str) -> String {
    format!("hatch-buildkit-{}", name_fragment(project_id))
}

/// Name of the isolated network for a project.
pub fn network_name(project_id: &str) -> String {
    format!("hatch-net-{}", name_fragment(project_id))
}

/// Name of the build cache volume for a project.
pub fn volume_name(project_id: &str) -> String {
    format!("hatch-buildkit-cache-{}", name_fragment(project_id))
}

/// The daemon command used when none is configured.
pub fn default_daemon_command(listen_port: u16) -> Vec<String> {
    vec![
        "buildkitd".to_string(),
        "--addr".to_string(),
        format!("tcp://0.0.0.0:{listen_port}"),
        "--addr".to_string(),
        "unix:///run/buildkit/buildkitd.sock".to_string(),
    ]
}

/// Runtime settings for [`BuildKit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildKitConfig {
    /// Image every accelerator must run. Containers on any other image are
    /// stale.
    pub image: String,
    /// Entrypoint starting the daemon.
    pub daemon_command: Vec<String>,
    /// Port the daemon listens on inside the project network.
    pub listen_port: u16,
    /// Where the cache volume is mounted.
    pub cache_mount: String,
    /// Open-file limit for the daemon.
    pub nofile_limit: u64,
    /// Retries for transient engine failures during pull and start.
    pub retry: RetryPolicy,
}

impl Default for BuildKitConfig {
    fn default() -> Self {
        Self {
            image: "hatch-sandbox:latest".to_string(),
            daemon_command: default_daemon_command(DEFAULT_LISTEN_PORT),
            listen_port: DEFAULT_LISTEN_PORT,
            cache_mount: "/var/lib/buildkit".to_string(),
            nofile_limit: 1_048_576,
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry of transient engine failures with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    /// Backoff unit; retry `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome of one [`BuildKit::reconcile`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Accelerators examined.
    pub inspected: usize,
    /// Stale accelerators removed.
    pub removed: Vec<String>,
    /// Stale accelerators that could not be removed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Orchestrates per-project accelerators on a container engine.
pub struct BuildKit<E> {
    engine: Arc<E>,
    config: BuildKitConfig,
}

impl<E: ContainerEngine> BuildKit<E> {
    /// Creates an orchestrator that provisions accelerators on `engine`.
    pub fn new(engine: Arc<E>, config: BuildKitConfig) -> Self {
        Self { engine, config }
    }

    /// Address sandboxes on the project network use to reach the daemon.
    pub fn endpoint(&self, project_id: &str) -> String {
        format!(
            "tcp://{}:{}",
            container_name(project_id),
            self.config.listen_port
        )
    }

    /// Makes sure the project's accelerator exists, runs the configured
    /// image and is started. Returns the container name.
    ///
    /// A running accelerator on the right image is left untouched. One on a
    /// different image is replaced; its network and cache volume are kept.
    pub async fn ensure(&self, ctx: &OpContext, project_id: &str) -> Result<String, SandboxError> {
        ctx.run(self.converge(project_id)).await
    }

    /// Removes the project's accelerator and network. The cache volume is
    /// kept. Missing resources are not an error.
    pub async fn remove(&self, ctx: &OpContext, project_id: &str) -> Result<(), SandboxError> {
        ctx.run(async {
            let name = container_name(project_id);
            let network = network_name(project_id);
            info!("Removing accelerator {} for project {}", name, project_id);
            ignore_not_found(self.engine.remove_container(&name).await)
                .map_err(SandboxError::from_engine)?;
            ignore_not_found(self.engine.remove_network(&network).await)
                .map_err(SandboxError::from_engine)?;
            Ok(())
        })
        .await
    }

    /// Removes every managed accelerator whose image differs from the
    /// configured one. Never creates anything; the next `ensure` for an
    /// affected project recreates its accelerator.
    pub async fn reconcile(&self, ctx: &OpContext) -> Result<ReconcileReport, SandboxError> {
        let accelerators = ctx
            .run(async {
                self.engine
                    .list_containers(&[(LABEL_MANAGED, "true"), (LABEL_ROLE, role::BUILDKIT)])
                    .await
                    .map_err(SandboxError::from_engine)
            })
            .await?;

        let mut report = ReconcileReport {
            inspected: accelerators.len(),
            ..Default::default()
        };

        for accelerator in accelerators {
            ctx.check()?;
            if accelerator.image == self.config.image {
                continue;
            }
            info!(
                "Removing stale accelerator {} (image {}, want {})",
                accelerator.name, accelerator.image, self.config.image
            );
            let removed = ctx
                .run(async { Ok(ignore_not_found(self.engine.remove_container(&accelerator.name).await)) })
                .await?;
            match removed {
                Ok(()) => report.removed.push(accelerator.name),
                Err(err) => {
                    warn!("Failed to remove stale accelerator {}: {}", accelerator.name, err);
                    report.failed.push((accelerator.name, err.to_string()));
                }
            }
        }

        debug!(
            "Reconcile done: {} inspected, {} removed, {} failed",
            report.inspected,
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn converge(&self, project_id: &str) -> Result<String, SandboxError> {
        let name = container_name(project_id);

        let existing = self
            .engine
            .inspect_container(&name)
            .await
            .map_err(SandboxError::from_engine)?;
        if let Some(existing) = existing {
            if existing.image == self.config.image {
                if existing.running {
                    debug!("Accelerator {} already running", name);
                } else {
                    info!("Starting stopped accelerator {}", name);
                    self.start(&name).await?;
                }
                return Ok(name);
            }
            info!(
                "Accelerator {} runs {}, replacing with {}",
                name, existing.image, self.config.image
            );
            ignore_not_found(self.engine.remove_container(&name).await)
                .map_err(SandboxError::from_engine)?;
        }

        self.ensure_network(project_id).await?;
        self.ensure_volume(project_id).await?;
        self.ensure_image().await?;

        match self
            .engine
            .create_container(&name, &self.accelerator_spec(project_id))
            .await
        {
            Ok(_) => {}
            Err(EngineError::Conflict { .. }) => {
                // Lost a creation race; adopt the winner's container.
                debug!("Accelerator {} created concurrently, adopting it", name);
                return self.adopt(&name).await;
            }
            Err(err) => return Err(SandboxError::from_engine_start(err)),
        }

        self.start(&name).await?;
        info!("Accelerator {} ready for project {}", name, project_id);
        Ok(name)
    }

    async fn adopt(&self, name: &str) -> Result<String, SandboxError> {
        match self
            .engine
            .inspect_container(name)
            .await
            .map_err(SandboxError::from_engine)?
        {
            Some(info) if info.running => Ok(name.to_string()),
            Some(_) => {
                self.start(name).await?;
                Ok(name.to_string())
            }
            None => Err(SandboxError::start_failed(format!(
                "accelerator {name} vanished after a creation conflict"
            ))),
        }
    }

    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        retry_transient(&self.config.retry, "start accelerator", || {
            self.engine.start_container(name)
        })
        .await
        .map_err(|e| SandboxError::start_failed(format!("accelerator {name}: {e}")))
    }

    async fn ensure_network(&self, project_id: &str) -> Result<(), SandboxError> {
        let network = network_name(project_id);
        let exists = self
            .engine
            .network_exists(&network)
            .await
            .map_err(SandboxError::from_engine_start)?;
        if exists {
            return Ok(());
        }
        match self
            .engine
            .create_network(&network, &self.labels(project_id, role::NETWORK))
            .await
        {
            Ok(()) | Err(EngineError::Conflict { .. }) => Ok(()),
            Err(err) => Err(SandboxError::from_engine_start(err)),
        }
    }

    async fn ensure_volume(&self, project_id: &str) -> Result<(), SandboxError> {
        let volume = volume_name(project_id);
        let exists = self
            .engine
            .volume_exists(&volume)
            .await
            .map_err(SandboxError::from_engine_start)?;
        if exists {
            return Ok(());
        }
        match self
            .engine
            .create_volume(&volume, &self.labels(project_id, role::BUILDKIT))
            .await
        {
            Ok(()) | Err(EngineError::Conflict { .. }) => Ok(()),
            Err(err) => Err(SandboxError::from_engine_start(err)),
        }
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        ensure_image(&*self.engine, &self.config.retry, &self.config.image).await
    }

    fn labels(&self, project_id: &str, role: &str) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_ROLE.to_string(), role.to_string()),
            (LABEL_PROJECT.to_string(), project_id.to_string()),
        ])
    }

    fn accelerator_spec(&self, project_id: &str) -> ContainerSpec {
        let mut labels = self.labels(project_id, role::BUILDKIT);
        labels.insert(LABEL_CREATED.to_string(), Utc::now().to_rfc3339());

        ContainerSpec {
            image: self.config.image.clone(),
            entrypoint: Some(self.config.daemon_command.clone()),
            labels,
            network: Some(network_name(project_id)),
            mounts: vec![MountSpec {
                kind: MountKind::Volume,
                source: volume_name(project_id),
                target: self.config.cache_mount.clone(),
                read_only: false,
            }],
            privileged: true,
            restart_unless_stopped: true,
            nofile_limit: Some(self.config.nofile_limit),
            ..Default::default()
        }
    }
}

/// Pulls `image` unless present, retrying transient failures.
pub(crate) async fn ensure_image<E: ContainerEngine + ?Sized>(
    engine: &E,
    retry: &RetryPolicy,
    image: &str,
) -> Result<(), SandboxError> {
    let present = engine
        .image_exists(image)
        .await
        .map_err(SandboxError::from_engine_start)?;
    if present {
        return Ok(());
    }
    retry_transient(retry, "pull image", || engine.pull_image(image))
        .await
        .map_err(SandboxError::from_engine_start)
}

/// Runs `op`, retrying transient engine failures with linear backoff.
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && retries < policy.attempts => {
                retries += 1;
                let delay = policy.backoff * retries;
                warn!(
                    "{} failed (retry {}/{} in {:?}): {}",
                    what, retries, policy.attempts, delay, err
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
