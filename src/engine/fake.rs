//! In-memory container engine for tests.
//!
//! Records every call and lets tests inject failures and creation races
//! without a Docker daemon.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{ContainerEngine, ContainerInfo, ContainerSpec, EngineError};
use crate::sandbox::{loopback_pty, AssignedPort, AttachOptions, ExecOptions, ExecResult, Pty};

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    state: &'static str,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, HashMap<String, String>>,
    volumes: HashMap<String, HashMap<String, String>>,
    images: HashSet<String>,
    unknown_images: HashSet<String>,
    exit_on_start: HashSet<String>,
    failures: HashMap<&'static str, VecDeque<EngineError>>,
    race_next_create: bool,
    next_id: u64,
}

/// A fake engine. Operation names used by [`FakeEngine::fail_next`] and
/// [`FakeEngine::count`] match the [`ContainerEngine`] method names.
#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `image` fail to resolve on pull.
    pub fn unknown_image(&self, image: &str) {
        self.state().unknown_images.insert(image.to_string());
    }

    /// Queues an error for the next call of `op`.
    pub fn fail_next(&self, op: &'static str, err: EngineError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// The next `create_container` finds that a competitor created the
    /// same name first (stopped), and fails with a conflict.
    pub fn race_next_create(&self) {
        self.state().race_next_create = true;
    }

    /// Containers with this name exit as soon as they start.
    pub fn exit_on_start(&self, name: &str) {
        self.state().exit_on_start.insert(name.to_string());
    }

    /// Seeds a container, as if created by an earlier process.
    pub fn insert_container(&self, name: &str, spec: ContainerSpec, running: bool) {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                spec,
                running,
                state: if running { "running" } else { "exited" },
            },
        );
    }

    /// Simulates a container dying outside our control.
    pub fn kill(&self, name: &str) {
        if let Some(c) = self.state().containers.get_mut(name) {
            c.running = false;
            c.state = "exited";
        }
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.state().containers.get(name).map(|c| info(name, c))
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state().containers.get(name).map(|c| c.spec.clone())
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains_key(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains_key(name)
    }

    /// Every call made so far, as `"<op> <target>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of `op` made so far.
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Records the call, yields so concurrent callers interleave, then
    /// pops any injected failure.
    async fn enter(&self, op: &'static str, target: &str) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(format!("{op} {target}"));
        tokio::task::yield_now().await;
        match self.state().failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn info(name: &str, c: &FakeContainer) -> ContainerInfo {
    ContainerInfo {
        id: c.id.clone(),
        name: name.to_string(),
        image: c.spec.image.clone(),
        running: c.running,
        state: c.state.to_string(),
        exit_code: (!c.running && c.state == "exited").then_some(0),
        error: None,
        labels: c.spec.labels.clone(),
        ports: c
            .spec
            .ports
            .iter()
            .map(|p| AssignedPort {
                container_port: p.container_port,
                host_port: p.host_port,
                host_ip: p.host_ip.clone(),
                protocol: p.protocol,
            })
            .collect(),
        created: Some(Utc::now()),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.enter("ping", "").await
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        self.enter("inspect_container", name).await?;
        Ok(self.container(name))
    }

    async fn list_containers(
        &self,
        labels: &[(&str, &str)],
    ) -> Result<Vec<ContainerInfo>, EngineError> {
        self.enter("list_containers", "").await?;
        let state = self.state();
        let mut found: Vec<ContainerInfo> = state
            .containers
            .iter()
            .filter(|(_, c)| {
                labels
                    .iter()
                    .all(|(k, v)| c.spec.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, c)| info(name, c))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        self.enter("create_container", name).await?;
        let mut state = self.state();
        if std::mem::take(&mut state.race_next_create) {
            state.next_id += 1;
            let id = format!("fake-{}", state.next_id);
            state.containers.insert(
                name.to_string(),
                FakeContainer {
                    id,
                    spec: spec.clone(),
                    running: false,
                    state: "created",
                },
            );
        }
        if state.containers.contains_key(name) {
            return Err(EngineError::conflict(format!(
                "container name \"/{name}\" is already in use"
            )));
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::not_found(format!("no such image: {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                state: "created",
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.enter("start_container", name).await?;
        let mut state = self.state();
        let exits = state.exit_on_start.contains(name);
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("no such container: {name}")))?;
        if exits {
            c.running = false;
            c.state = "exited";
        } else {
            c.running = true;
            c.state = "running";
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<(), EngineError> {
        self.enter("stop_container", name).await?;
        let mut state = self.state();
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("no such container: {name}")))?;
        c.running = false;
        c.state = "exited";
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.enter("remove_container", name).await?;
        match self.state().containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found(format!("no such container: {name}"))),
        }
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        self.enter("network_exists", name).await?;
        Ok(self.has_network(name))
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.enter("create_network", name).await?;
        let mut state = self.state();
        if state.networks.contains_key(name) {
            return Err(EngineError::conflict(format!("network {name} already exists")));
        }
        state.networks.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.enter("remove_network", name).await?;
        let mut state = self.state();
        let attached = state
            .containers
            .values()
            .any(|c| c.spec.network.as_deref() == Some(name));
        if attached {
            return Err(EngineError::conflict(format!(
                "network {name} has active endpoints"
            )));
        }
        match state.networks.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found(format!("network {name} not found"))),
        }
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        self.enter("volume_exists", name).await?;
        Ok(self.has_volume(name))
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.enter("create_volume", name).await?;
        // Docker treats re-creating a volume as a no-op.
        self.state()
            .volumes
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.enter("image_exists", image).await?;
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.enter("pull_image", image).await?;
        let mut state = self.state();
        if state.unknown_images.contains(image) {
            return Err(EngineError::InvalidImage {
                image: image.to_string(),
            });
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        _options: &ExecOptions,
    ) -> Result<ExecResult, EngineError> {
        self.enter("exec", container).await?;
        match self.state().containers.get(container) {
            Some(c) if c.running => Ok(ExecResult {
                exit_code: 0,
                stdout: format!("{}\n", cmd.join(" ")).into_bytes(),
                stderr: Vec::new(),
            }),
            Some(_) => Err(EngineError::conflict(format!(
                "container {container} is not running"
            ))),
            None => Err(EngineError::not_found(format!(
                "no such container: {container}"
            ))),
        }
    }

    async fn attach(
        &self,
        container: &str,
        _command: &[String],
        options: &AttachOptions,
    ) -> Result<Pty, EngineError> {
        self.enter("attach", container).await?;
        if !self
            .state()
            .containers
            .get(container)
            .is_some_and(|c| c.running)
        {
            return Err(EngineError::conflict(format!(
                "container {container} is not running"
            )));
        }
        Ok(loopback_pty(options.rows, options.cols).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_engine_tracks_calls() {
        let engine = FakeEngine::new();
        assert_eq!(engine.count("pull_image"), 0);

        engine.pull_image("img:1").await.unwrap();
        assert!(engine.image_exists("img:1").await.unwrap());
        assert_eq!(engine.count("pull_image"), 1);
        assert_eq!(engine.calls()[0], "pull_image img:1");
    }

    #[tokio::test]
    async fn test_fake_engine_injected_failure_is_consumed() {
        let engine = FakeEngine::new();
        engine.fail_next("ping", EngineError::unavailable("down"));

        assert!(engine.ping().await.unwrap_err().is_transient());
        assert!(engine.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_engine_name_conflict() {
        let engine = FakeEngine::new();
        engine.pull_image("img:1").await.unwrap();
        let spec = ContainerSpec {
            image: "img:1".to_string(),
            ..Default::default()
        };

        engine.create_container("c", &spec).await.unwrap();
        let err = engine.create_container("c", &spec).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
