//! Sandbox provider over a container engine.
//!
//! Each sandbox is one container named after its session. Sandboxes created
//! with a project id join that project's network and get `BUILDKIT_HOST`
//! pointing at its accelerator.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{TcpListener, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    env_pairs, is_valid_image_reference, AssignedPort, AttachOptions, CreateOptions, ExecOptions,
    ExecResult, OpContext, PortMapping, Protocol, Provider, Pty, ResourceLimits, Sandbox,
    SandboxError, SandboxStatus, SessionLocks,
};
use crate::buildkit::{self, BuildKit, BuildKitConfig, RetryPolicy};
use crate::engine::{
    ignore_not_found, name_fragment, role, ContainerEngine, ContainerInfo, ContainerSpec,
    DockerEngine, EngineError, MountKind, MountSpec, PortSpec, LABEL_CREATED, LABEL_MANAGED,
    LABEL_PROJECT, LABEL_ROLE, LABEL_SESSION,
};

/// Metadata key holding the container name.
pub const META_CONTAINER: &str = "container";
/// Metadata key holding the project's accelerator name.
pub const META_BUILDKIT: &str = "buildkit";
/// Metadata key holding the project network name.
pub const META_NETWORK: &str = "network";
/// Metadata key holding the maximum lifetime in milliseconds.
pub const META_MAX_LIFETIME: &str = "max_lifetime_ms";

/// Settings for [`ContainerProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerProviderConfig {
    /// Image used when `CreateOptions::image` is empty.
    pub default_image: String,
    /// Startup command keeping the container alive when none is given.
    pub keepalive_command: Vec<String>,
    /// Command run by `attach` when none is given.
    pub shell: Vec<String>,
    /// Working directory when none is given.
    pub working_dir: Option<String>,
    /// Host IP published ports bind to.
    pub host_ip: String,
    /// Prefix of sandbox container names.
    pub name_prefix: String,
    /// Limits applied where `CreateOptions::resources` leaves a field at zero.
    pub default_resources: ResourceLimits,
    /// Grace period when a sandbox outlives its maximum lifetime.
    pub stop_timeout: Duration,
    /// Retries for transient engine failures during pull and start.
    pub retry: RetryPolicy,
    /// Per-project accelerators; `None` disables them.
    pub buildkit: Option<BuildKitConfig>,
}

impl Default for ContainerProviderConfig {
    fn default() -> Self {
        Self {
            default_image: "hatch-sandbox:latest".to_string(),
            keepalive_command: vec!["sleep".to_string(), "infinity".to_string()],
            shell: vec!["/bin/bash".to_string(), "-l".to_string()],
            working_dir: Some("/workspace".to_string()),
            host_ip: "127.0.0.1".to_string(),
            name_prefix: "hatch-sandbox-".to_string(),
            default_resources: ResourceLimits::default(),
            stop_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            buildkit: Some(BuildKitConfig::default()),
        }
    }
}

struct Inner<E> {
    engine: Arc<E>,
    config: ContainerProviderConfig,
    buildkit: Option<BuildKit<E>>,
    sandboxes: RwLock<HashMap<String, Sandbox>>,
    locks: SessionLocks,
    /// Pending max-lifetime timers, cancelled on stop and remove.
    expiries: Mutex<HashMap<String, CancellationToken>>,
}

/// [`Provider`] backed by any [`ContainerEngine`].
pub struct ContainerProvider<E> {
    inner: Arc<Inner<E>>,
}

/// The provider over the local Docker daemon.
pub type DockerProvider = ContainerProvider<DockerEngine>;

impl DockerProvider {
    /// Connects to the local Docker daemon.
    pub async fn connect(config: ContainerProviderConfig) -> Result<Self, SandboxError> {
        let engine = DockerEngine::connect()
            .await
            .map_err(SandboxError::from_engine)?;
        Ok(Self::new(Arc::new(engine), config))
    }
}

impl<E: ContainerEngine> ContainerProvider<E> {
    /// Creates a provider with an empty registry. Call
    /// [`ContainerProvider::recover`] to adopt sandboxes already running.
    pub fn new(engine: Arc<E>, config: ContainerProviderConfig) -> Self {
        let buildkit = config
            .buildkit
            .clone()
            .map(|bk| BuildKit::new(Arc::clone(&engine), bk));
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                buildkit,
                sandboxes: RwLock::new(HashMap::new()),
                locks: SessionLocks::new(),
                expiries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The accelerator orchestrator, if enabled.
    pub fn buildkit(&self) -> Option<&BuildKit<E>> {
        self.inner.buildkit.as_ref()
    }

    /// Rebuilds the registry from sandbox containers already on the engine,
    /// e.g. after a restart. Sessions already tracked are left alone.
    /// Returns the number of sandboxes added.
    pub async fn recover(&self, ctx: &OpContext) -> Result<usize, SandboxError> {
        let containers = ctx
            .run(async {
                self.inner
                    .engine
                    .list_containers(&[(LABEL_MANAGED, "true"), (LABEL_ROLE, role::SANDBOX)])
                    .await
                    .map_err(SandboxError::from_engine)
            })
            .await?;

        let mut sandboxes = self.inner.sandboxes.write().await;
        let mut recovered = 0;
        for info in containers {
            let Some(session_id) = info.labels.get(LABEL_SESSION).cloned() else {
                continue;
            };
            if sandboxes.contains_key(&session_id) {
                continue;
            }
            debug!("Recovered sandbox {} ({})", session_id, info.name);
            sandboxes.insert(session_id.clone(), recovered_sandbox(info, session_id));
            recovered += 1;
        }
        Ok(recovered)
    }
}

/// Runs mutating work in its own task so it finishes even if the caller
/// stops waiting for it.
async fn detached<T, F>(ctx: &OpContext, work: F) -> Result<T, SandboxError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SandboxError>> + Send + 'static,
{
    let task = tokio::spawn(work);
    ctx.run(async move {
        task.await
            .map_err(|e| SandboxError::unavailable(format!("sandbox task failed: {e}")))?
    })
    .await
}

impl<E: ContainerEngine> Inner<E> {
    fn container_name(&self, session_id: &str) -> String {
        format!("{}{}", self.config.name_prefix, name_fragment(session_id))
    }

    async fn lookup(&self, session_id: &str) -> Result<Sandbox, SandboxError> {
        self.sandboxes
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(session_id))
    }

    fn container_of(&self, sandbox: &Sandbox) -> String {
        sandbox
            .metadata
            .get(META_CONTAINER)
            .cloned()
            .unwrap_or_else(|| self.container_name(&sandbox.session_id))
    }

    async fn provision(
        &self,
        session_id: &str,
        options: CreateOptions,
    ) -> Result<Sandbox, SandboxError> {
        if self.sandboxes.read().await.contains_key(session_id) {
            return Err(SandboxError::already_exists(session_id));
        }

        let image = if options.image.is_empty() {
            self.config.default_image.clone()
        } else {
            options.image.clone()
        };
        if !is_valid_image_reference(&image) {
            return Err(SandboxError::invalid_image(image));
        }

        let mut env = options.env.clone();
        let mut metadata = HashMap::new();
        let mut network = None;
        if let (Some(bk), Some(project)) = (&self.buildkit, options.project_id.as_deref()) {
            let accelerator = bk.ensure(&OpContext::background(), project).await?;
            env.entry("BUILDKIT_HOST".to_string())
                .or_insert_with(|| bk.endpoint(project));
            metadata.insert(META_BUILDKIT.to_string(), accelerator);
            metadata.insert(META_NETWORK.to_string(), buildkit::network_name(project));
            network = Some(buildkit::network_name(project));
        }

        buildkit::ensure_image(&*self.engine, &self.config.retry, &image).await?;

        let ports = self.reserve_ports(&options.ports)?;
        let resources = self.effective_resources(&options.resources);
        let name = self.container_name(session_id);
        let spec = self.sandbox_spec(session_id, &image, &options, &env, &resources, &ports, network);

        let id = self
            .engine
            .create_container(&name, &spec)
            .await
            .map_err(|err| match err {
                // A container from an earlier process still holds the name.
                EngineError::Conflict { .. } => SandboxError::already_exists(session_id),
                other => SandboxError::from_engine_start(other),
            })?;

        let mut sandbox = Sandbox::new(id, session_id, image);
        sandbox.project_id = options.project_id;
        sandbox.env = env;
        sandbox.ports = ports
            .into_iter()
            .map(|p| AssignedPort {
                container_port: p.container_port,
                host_port: p.host_port,
                host_ip: p.host_ip,
                protocol: p.protocol,
            })
            .collect();
        sandbox.metadata = metadata;
        sandbox.metadata.insert(META_CONTAINER.to_string(), name);
        if !resources.max_lifetime.is_zero() {
            sandbox.metadata.insert(
                META_MAX_LIFETIME.to_string(),
                resources.max_lifetime.as_millis().to_string(),
            );
        }

        self.sandboxes
            .write()
            .await
            .insert(session_id.to_string(), sandbox.clone());
        info!("Created sandbox {} for session {}", sandbox.id, session_id);
        Ok(sandbox)
    }

    fn effective_resources(&self, requested: &ResourceLimits) -> ResourceLimits {
        let defaults = &self.config.default_resources;
        ResourceLimits {
            memory_bytes: if requested.memory_bytes == 0 {
                defaults.memory_bytes
            } else {
                requested.memory_bytes
            },
            cpus: if requested.cpus > 0.0 {
                requested.cpus
            } else {
                defaults.cpus
            },
            disk_bytes: if requested.disk_bytes == 0 {
                defaults.disk_bytes
            } else {
                requested.disk_bytes
            },
            max_lifetime: if requested.max_lifetime.is_zero() {
                defaults.max_lifetime
            } else {
                requested.max_lifetime
            },
        }
    }

    fn reserve_ports(&self, requested: &[PortMapping]) -> Result<Vec<PortSpec>, SandboxError> {
        requested
            .iter()
            .map(|mapping| {
                let host_port = match mapping.fixed_host_port() {
                    Some(port) => port,
                    None => free_host_port(&self.config.host_ip, mapping.protocol).map_err(|e| {
                        SandboxError::resource_limit_exceeded(format!("no free host port: {e}"))
                    })?,
                };
                Ok(PortSpec {
                    container_port: mapping.container_port,
                    host_port,
                    host_ip: self.config.host_ip.clone(),
                    protocol: mapping.protocol,
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn sandbox_spec(
        &self,
        session_id: &str,
        image: &str,
        options: &CreateOptions,
        env: &HashMap<String, String>,
        resources: &ResourceLimits,
        ports: &[PortSpec],
        network: Option<String>,
    ) -> ContainerSpec {
        let mut labels = options.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_ROLE.to_string(), role::SANDBOX.to_string());
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());
        labels.insert(LABEL_CREATED.to_string(), Utc::now().to_rfc3339());
        if let Some(project) = &options.project_id {
            labels.insert(LABEL_PROJECT.to_string(), project.clone());
        }

        let mounts = options
            .storage
            .iter()
            .map(|storage| MountSpec {
                kind: MountKind::Bind,
                source: storage.source.clone(),
                target: storage.mount_path.clone(),
                read_only: storage.read_only,
            })
            .collect();

        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (resources.cpus > 0.0).then(|| (resources.cpus * 1_000_000_000.0) as i64);

        ContainerSpec {
            image: image.to_string(),
            entrypoint: None,
            command: Some(
                options
                    .command
                    .clone()
                    .unwrap_or_else(|| self.config.keepalive_command.clone()),
            ),
            env: env_pairs(env),
            labels,
            working_dir: options
                .working_dir
                .clone()
                .or_else(|| self.config.working_dir.clone()),
            network,
            mounts,
            ports: ports.to_vec(),
            memory_bytes: (resources.memory_bytes > 0)
                .then(|| i64::try_from(resources.memory_bytes).unwrap_or(i64::MAX)),
            nano_cpus,
            disk_bytes: (resources.disk_bytes > 0).then_some(resources.disk_bytes),
            ..Default::default()
        }
    }

    async fn start_sandbox(self: &Arc<Self>, session_id: &str) -> Result<(), SandboxError> {
        let sandbox = self.lookup(session_id).await?;
        if sandbox.status.is_running() {
            return Err(SandboxError::already_running(session_id));
        }
        let name = self.container_of(&sandbox);

        let outcome = match buildkit::retry_transient(&self.config.retry, "start sandbox", || {
            self.engine.start_container(&name)
        })
        .await
        {
            Ok(()) => match self.engine.inspect_container(&name).await {
                Ok(Some(info)) if info.running => Ok(()),
                Ok(Some(info)) => Err(format!(
                    "container exited immediately (state {}, exit code {})",
                    info.state,
                    info.exit_code
                        .map_or_else(|| "unknown".to_string(), |c| c.to_string())
                )),
                Ok(None) => Err("container disappeared".to_string()),
                Err(err) => Err(err.to_string()),
            },
            Err(err) => Err(err.to_string()),
        };

        let mut sandboxes = self.sandboxes.write().await;
        let entry = sandboxes
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        match outcome {
            Ok(()) => {
                entry.mark_running();
                info!("Started sandbox for session {}", session_id);
                let lifetime = entry
                    .metadata
                    .get(META_MAX_LIFETIME)
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_millis);
                if let (Some(lifetime), Some(started_at)) = (lifetime, entry.started_at) {
                    self.schedule_expiry(session_id.to_string(), started_at, lifetime);
                }
                Ok(())
            }
            Err(message) => {
                warn!("Sandbox for session {} failed to start: {}", session_id, message);
                entry.mark_failed(message.clone());
                Err(SandboxError::start_failed(message))
            }
        }
    }

    /// Stops the sandbox once it has run for `lifetime`, unless it was
    /// stopped or restarted in the meantime.
    fn schedule_expiry(self: &Arc<Self>, session_id: String, started_at: DateTime<Utc>, lifetime: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .expiries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), token.clone())
        {
            previous.cancel();
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(lifetime) => {}
            }
            let _guard = inner.locks.lock(&session_id).await;
            let still_same_run = inner
                .sandboxes
                .read()
                .await
                .get(&session_id)
                .is_some_and(|s| s.status.is_running() && s.started_at == Some(started_at));
            if !still_same_run {
                return;
            }
            info!("Sandbox for session {} reached its maximum lifetime", session_id);
            if let Err(err) = inner.stop_sandbox(&session_id, inner.config.stop_timeout).await {
                warn!("Failed to stop expired sandbox {}: {}", session_id, err);
            }
        });
    }

    fn cancel_expiry(&self, session_id: &str) {
        if let Some(token) = self
            .expiries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
        {
            token.cancel();
        }
    }

    /// Number of lifetime timers still pending.
    #[cfg(test)]
    fn pending_expiries(&self) -> usize {
        self.expiries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn stop_sandbox(&self, session_id: &str, timeout: Duration) -> Result<(), SandboxError> {
        let sandbox = self.lookup(session_id).await?;
        if !sandbox.status.is_running() {
            return Err(SandboxError::not_running(session_id));
        }
        let name = self.container_of(&sandbox);

        match self.engine.stop_container(&name, timeout).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!("Container {} vanished before stop", name);
            }
            Err(err) => return Err(SandboxError::from_engine(err)),
        }

        if let Some(entry) = self.sandboxes.write().await.get_mut(session_id) {
            entry.mark_stopped();
        }
        self.cancel_expiry(session_id);
        info!("Stopped sandbox for session {}", session_id);
        Ok(())
    }

    async fn remove_sandbox(&self, session_id: &str) -> Result<(), SandboxError> {
        self.cancel_expiry(session_id);
        let registered = self
            .sandboxes
            .read()
            .await
            .get(session_id)
            .map(|sandbox| self.container_of(sandbox));

        let name = match registered {
            Some(name) => name,
            None => {
                // Only clear a leftover container labelled with this session.
                let name = self.container_name(session_id);
                let owner = self
                    .engine
                    .inspect_container(&name)
                    .await
                    .map_err(SandboxError::from_engine)?
                    .and_then(|info| info.labels.get(LABEL_SESSION).cloned());
                match owner {
                    Some(owner) if owner == session_id => name,
                    Some(owner) => {
                        warn!(
                            "Container {} belongs to session {}, not {}; leaving it",
                            name, owner, session_id
                        );
                        return Ok(());
                    }
                    None => return Ok(()),
                }
            }
        };

        ignore_not_found(self.engine.remove_container(&name).await)
            .map_err(SandboxError::from_engine)?;
        if self.sandboxes.write().await.remove(session_id).is_some() {
            info!("Removed sandbox for session {}", session_id);
        }
        Ok(())
    }
}

#[async_trait]
impl<E: ContainerEngine> Provider for ContainerProvider<E> {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn create(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: CreateOptions,
    ) -> Result<Sandbox, SandboxError> {
        let guard = ctx
            .run(async { Ok(self.inner.locks.lock(session_id).await) })
            .await?;
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        detached(ctx, async move {
            let _guard = guard;
            inner.provision(&session_id, options).await
        })
        .await
    }

    async fn start(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError> {
        let guard = ctx
            .run(async { Ok(self.inner.locks.lock(session_id).await) })
            .await?;
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        detached(ctx, async move {
            let _guard = guard;
            inner.start_sandbox(&session_id).await
        })
        .await
    }

    async fn stop(
        &self,
        ctx: &OpContext,
        session_id: &str,
        timeout: Duration,
    ) -> Result<(), SandboxError> {
        let guard = ctx
            .run(async { Ok(self.inner.locks.lock(session_id).await) })
            .await?;
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        detached(ctx, async move {
            let _guard = guard;
            inner.stop_sandbox(&session_id, timeout).await
        })
        .await
    }

    async fn remove(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError> {
        let guard = ctx
            .run(async { Ok(self.inner.locks.lock(session_id).await) })
            .await?;
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        detached(ctx, async move {
            let _guard = guard;
            inner.remove_sandbox(&session_id).await
        })
        .await
    }

    async fn get(&self, ctx: &OpContext, session_id: &str) -> Result<Sandbox, SandboxError> {
        ctx.check()?;
        self.inner.lookup(session_id).await
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<Sandbox>, SandboxError> {
        ctx.check()?;
        Ok(self.inner.sandboxes.read().await.values().cloned().collect())
    }

    async fn exec(
        &self,
        ctx: &OpContext,
        session_id: &str,
        cmd: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        let sandbox = self.inner.lookup(session_id).await?;
        if cmd.is_empty() {
            return Err(SandboxError::exec_failed("empty command"));
        }
        let name = self.inner.container_of(&sandbox);
        debug!("Exec in session {}: {:?}", session_id, cmd);
        ctx.run(async {
            self.inner
                .engine
                .exec(&name, cmd, &options)
                .await
                .map_err(|e| SandboxError::exec_failed(e.to_string()))
        })
        .await
    }

    async fn attach(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: AttachOptions,
    ) -> Result<Pty, SandboxError> {
        let sandbox = self.inner.lookup(session_id).await?;
        if !sandbox.status.is_running() {
            return Err(SandboxError::not_running(session_id));
        }
        let name = self.inner.container_of(&sandbox);
        let command = options
            .command
            .clone()
            .unwrap_or_else(|| self.inner.config.shell.clone());
        let mut options = options;
        if options.working_dir.is_none() {
            options.working_dir.clone_from(&self.inner.config.working_dir);
        }
        ctx.run(async {
            self.inner
                .engine
                .attach(&name, &command, &options)
                .await
                .map_err(|e| SandboxError::attach_failed(e.to_string()))
        })
        .await
    }
}

fn free_host_port(host_ip: &str, protocol: Protocol) -> io::Result<u16> {
    match protocol {
        Protocol::Tcp => Ok(TcpListener::bind((host_ip, 0))?.local_addr()?.port()),
        Protocol::Udp => Ok(UdpSocket::bind((host_ip, 0))?.local_addr()?.port()),
    }
}

fn recovered_sandbox(info: ContainerInfo, session_id: String) -> Sandbox {
    let mut sandbox = Sandbox::new(info.id, session_id, info.image);
    sandbox.project_id = info.labels.get(LABEL_PROJECT).cloned();
    if let Some(created) = info
        .labels
        .get(LABEL_CREATED)
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .or(info.created)
    {
        sandbox.created_at = created;
    }
    sandbox.ports = info.ports;
    sandbox.metadata.insert(META_CONTAINER.to_string(), info.name);
    if let Some(project) = &sandbox.project_id {
        sandbox
            .metadata
            .insert(META_BUILDKIT.to_string(), buildkit::container_name(project));
        sandbox
            .metadata
            .insert(META_NETWORK.to_string(), buildkit::network_name(project));
    }

    sandbox.status = if info.running {
        SandboxStatus::Running
    } else {
        match info.state.as_str() {
            "created" => SandboxStatus::Created,
            "dead" => SandboxStatus::Failed,
            _ => SandboxStatus::Stopped,
        }
    };
    if sandbox.status == SandboxStatus::Failed {
        sandbox.error = Some(info.error.unwrap_or_else(|| "container is dead".to_string()));
    }
    sandbox
}
