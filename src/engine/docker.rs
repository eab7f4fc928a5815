use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, HostConfig, Mount, MountTypeEnum, PortBinding, PortMap,
    ResourcesUlimits, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineError, MountKind, PortSpec,
};
use crate::sandbox::{
    env_pairs, AssignedPort, AttachOptions, ExecOptions, ExecResult, Protocol, Pty, PtyControl,
    SandboxError,
};

/// Writes all of `stdin` to an exec, then half-closes it so the command sees
/// end of input.
async fn feed_stdin<W>(input: &mut W, stdin: Option<&[u8]>) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
{
    let Some(stdin) = stdin else {
        return Ok(());
    };
    input
        .write_all(stdin)
        .await
        .map_err(|e| EngineError::unavailable(format!("Failed to write exec stdin: {e}")))?;
    input
        .shutdown()
        .await
        .map_err(|e| EngineError::unavailable(format!("Failed to close exec stdin: {e}")))
}

/// Drains an exec's output into `result`. A broken stream fails the whole
/// exec rather than returning truncated output.
async fn collect_output<S>(stream: &mut S, result: &mut ExecResult) -> Result<(), EngineError>
where
    S: Stream<Item = Result<LogOutput, BollardError>> + Unpin,
{
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                result.stdout.extend_from_slice(&message);
            }
            Ok(LogOutput::StdErr { message }) => {
                result.stderr.extend_from_slice(&message);
            }
            Ok(LogOutput::StdIn { .. }) => {}
            Err(e) => {
                return Err(EngineError::unavailable(format!(
                    "Exec output stream failed: {e}"
                )));
            }
        }
    }
    Ok(())
}

/// How often a finished-or-not check is made on an interactive exec.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// [`ContainerEngine`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the local Docker daemon and checks it responds.
    pub async fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::unavailable(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        let engine = Self { docker };
        engine.ping().await?;
        Ok(engine)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::unavailable(format!("Cannot ping Docker daemon: {e}")))
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(container_info(response))),
            Err(err) => match translate(err) {
                EngineError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerInfo>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>(),
        );

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(translate)?;

        // Summaries report the resolved image id once a tag moves, so each
        // container is inspected for the reference it was created from.
        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            if let Some(info) = self.inspect_container(&id).await? {
                containers.push(info);
            }
        }
        Ok(containers)
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        debug!("Creating container: {}", name);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(translate)?;

        for warning in response.warnings {
            warn!("Docker warning for {}: {}", name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        debug!("Starting container: {}", name);
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(translate(err)),
        }
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), EngineError> {
        debug!("Stopping container: {} (timeout {:?})", name, timeout);
        let t = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(translate(err)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        debug!("Removing container: {}", name);
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(translate)
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => match translate(err) {
                EngineError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        info!("Creating network: {}", name);
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(translate)
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        info!("Removing network: {}", name);
        self.docker.remove_network(name).await.map_err(translate)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(err) => match translate(err) {
                EngineError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        info!("Creating volume: {}", name);
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(translate)
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(err) => match translate(err) {
                EngineError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        info!("Pulling image {}...", image);
        let pull_options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(pull_options), None, None);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(pull_error(image, &error));
                    }
                    if let Some(status) = progress.status {
                        debug!("pull {}: {}", image, status.trim());
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    return Err(pull_error(image, &error));
                }
                Err(BollardError::DockerResponseServerError {
                    status_code: 404,
                    ..
                }) => return Err(EngineError::InvalidImage { image: image.to_string() }),
                Err(err) => return Err(translate(err)),
            }
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        options: &ExecOptions,
    ) -> Result<ExecResult, EngineError> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(options.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    env: Some(env_pairs(&options.env)),
                    working_dir: options.working_dir.clone(),
                    user: options.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(translate)?;

        let mut result = ExecResult::default();

        if let StartExecResults::Attached {
            output: mut stream,
            mut input,
        } = self.docker.start_exec(&exec.id, None).await.map_err(translate)?
        {
            let (fed, collected) = tokio::join!(
                feed_stdin(&mut input, options.stdin.as_deref()),
                collect_output(&mut stream, &mut result)
            );
            fed?;
            collected?;
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(translate)?;
        result.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(result)
    }

    async fn attach(
        &self,
        container: &str,
        command: &[String],
        options: &AttachOptions,
    ) -> Result<Pty, EngineError> {
        let mut env = env_pairs(&options.env);
        if !options.env.contains_key("TERM") {
            env.push("TERM=xterm-256color".to_string());
        }

        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    env: Some(env),
                    working_dir: options.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(translate)?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(translate)?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(EngineError::unavailable("terminal exec started detached"));
        };

        let control = ExecPtyControl {
            docker: self.docker.clone(),
            exec_id: exec.id,
        };
        if let Err(e) = control.resize(options.rows, options.cols).await {
            warn!("Initial terminal resize failed: {}", e);
        }

        let reader = StreamReader::new(
            output.map(|chunk| chunk.map(LogOutput::into_bytes).map_err(io::Error::other)),
        );
        Ok(Pty::new(reader, input, control))
    }
}

struct ExecPtyControl {
    docker: Docker,
    exec_id: String,
}

#[async_trait]
impl PtyControl for ExecPtyControl {
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), SandboxError> {
        self.docker
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| SandboxError::attach_failed(format!("resize failed: {e}")))
    }

    async fn wait(&self) -> Result<i64, SandboxError> {
        loop {
            let inspect = self
                .docker
                .inspect_exec(&self.exec_id)
                .await
                .map_err(|e| SandboxError::attach_failed(format!("cannot inspect exec: {e}")))?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    async fn terminate(&self) {
        // Docker cannot kill an exec directly; dropping the hijacked
        // connection hangs up the TTY, which ends the process.
        debug!("Released terminal exec {}", self.exec_id);
    }
}

/// Maps a bollard error onto the engine's failure kinds.
fn translate(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound { what: message },
            409 => EngineError::Conflict { message },
            500 if message.contains("no space left") => EngineError::ResourceLimit { message },
            500..=599 => EngineError::Unavailable { message },
            status => EngineError::Rejected { status, message },
        },
        other => EngineError::unavailable(other.to_string()),
    }
}

fn pull_error(image: &str, message: &str) -> EngineError {
    let lowered = message.to_lowercase();
    if lowered.contains("not found")
        || lowered.contains("manifest unknown")
        || lowered.contains("pull access denied")
        || lowered.contains("invalid reference")
    {
        EngineError::InvalidImage {
            image: image.to_string(),
        }
    } else {
        EngineError::unavailable(format!("pull of {image} failed: {message}"))
    }
}

fn container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(match m.kind {
                MountKind::Bind => expand_path(&m.source),
                MountKind::Volume => m.source.clone(),
            }),
            typ: Some(match m.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: PortMap = HashMap::new();
    for port in &spec.ports {
        let key = port_key(port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: Some(port.host_port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        mounts: (!mounts.is_empty()).then_some(mounts),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: spec.network.clone(),
        privileged: spec.privileged.then_some(true),
        restart_policy: spec.restart_unless_stopped.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        ulimits: spec.nofile_limit.map(|limit| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(limit),
                hard: Some(limit),
            }]
        }),
        memory: spec.memory_bytes,
        nano_cpus: spec.nano_cpus,
        storage_opt: spec
            .disk_bytes
            .map(|bytes| HashMap::from([("size".to_string(), bytes.to_string())])),
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.command.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        labels: Some(spec.labels.clone()),
        working_dir: spec.working_dir.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn port_key(port: &PortSpec) -> String {
    format!("{}/{}", port.container_port, port.protocol)
}

fn container_info(response: ContainerInspectResponse) -> ContainerInfo {
    let state = response.state.unwrap_or_default();
    let config = response.config.unwrap_or_default();

    // Live bindings appear only once the container runs; fall back to the
    // requested ones so stopped containers still report their ports.
    let live = response.network_settings.and_then(|n| n.ports);
    let requested = response.host_config.and_then(|h| h.port_bindings);
    let ports = match live {
        Some(map) if map.values().any(Option::is_some) => parse_port_map(&map),
        _ => requested.as_ref().map(parse_port_map).unwrap_or_default(),
    };

    ContainerInfo {
        id: response.id.unwrap_or_default(),
        name: response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        running: state.running.unwrap_or(false),
        state: state.status.map(|s| s.to_string()).unwrap_or_default(),
        exit_code: state.exit_code,
        error: state.error.filter(|e| !e.is_empty()),
        labels: config.labels.unwrap_or_default(),
        ports,
        created: response
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|c| c.with_timezone(&Utc)),
    }
}

fn parse_port_map(map: &PortMap) -> Vec<AssignedPort> {
    let mut ports = Vec::new();
    for (key, bindings) in map {
        let Some((port, proto)) = key.split_once('/') else {
            continue;
        };
        let (Ok(container_port), Ok(protocol)) = (port.parse::<u16>(), proto.parse::<Protocol>())
        else {
            continue;
        };
        for binding in bindings.iter().flatten() {
            let Some(host_port) = binding
                .host_port
                .as_deref()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            ports.push(AssignedPort {
                container_port,
                host_port,
                host_ip: binding.host_ip.clone().unwrap_or_default(),
                protocol,
            });
        }
    }
    ports.sort_by_key(|p| (p.container_port, p.host_port));
    ports
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}
