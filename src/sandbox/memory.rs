//! In-memory reference provider.
//!
//! Implements the full [`Provider`] contract without any real isolation:
//! sandboxes are registry entries, commands run against a small built-in
//! interpreter (or a caller-supplied handler), and attach hands out a
//! loopback terminal that echoes its input. Useful for:
//! - Tests of code that consumes a `Provider`
//! - Running the session layer without a container engine
//! - Checking the contract semantics every other backend must match

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    is_valid_image_reference, AssignedPort, AttachOptions, CreateOptions, ExecOptions, ExecResult,
    OpContext, PortMapping, Provider, Pty, PtyControl, Sandbox, SandboxError, SessionLocks,
};

/// Range host ports are handed out from when a mapping asks for one.
const FIRST_DYNAMIC_PORT: u16 = 32768;
const LAST_DYNAMIC_PORT: u16 = u16::MAX;

/// Default image recorded when `CreateOptions::image` is empty.
const DEFAULT_IMAGE: &str = "hatch-sandbox:latest";

/// Signature of a custom command handler.
pub type ExecHandler = dyn Fn(&[String], &ExecOptions) -> ExecResult + Send + Sync;

/// A provider that keeps every sandbox in process memory.
pub struct MemoryProvider {
    sandboxes: RwLock<HashMap<String, Sandbox>>,
    locks: SessionLocks,
    next_port: AtomicU16,
    default_image: String,
    max_sandboxes: Option<usize>,
    exec_handler: Arc<ExecHandler>,
    start_failures: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("default_image", &self.default_image)
            .field("max_sandboxes", &self.max_sandboxes)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Creates an empty provider with the built-in command interpreter.
    pub fn new() -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            locks: SessionLocks::new(),
            next_port: AtomicU16::new(FIRST_DYNAMIC_PORT),
            default_image: DEFAULT_IMAGE.to_string(),
            max_sandboxes: None,
            exec_handler: Arc::new(builtin_exec),
            start_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the image used when a create request leaves it empty.
    #[must_use]
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Caps the number of live sandboxes; creates beyond it fail with
    /// `ResourceLimitExceeded`.
    #[must_use]
    pub fn with_capacity_limit(mut self, max: usize) -> Self {
        self.max_sandboxes = Some(max);
        self
    }

    /// Replaces the built-in interpreter used by `exec`.
    #[must_use]
    pub fn with_exec_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[String], &ExecOptions) -> ExecResult + Send + Sync + 'static,
    {
        self.exec_handler = Arc::new(handler);
        self
    }

    /// Makes the next `start` of `session_id` fail with `message`.
    pub fn fail_next_start(&self, session_id: &str, message: impl Into<String>) {
        self.start_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), message.into());
    }

    fn take_start_failure(&self, session_id: &str) -> Option<String> {
        self.start_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    /// Realizes port mappings, never handing out a host port another live
    /// sandbox (or this request) already holds.
    fn assign_ports(
        &self,
        options: &CreateOptions,
        live: &HashMap<String, Sandbox>,
    ) -> Result<Vec<AssignedPort>, SandboxError> {
        let mut taken: HashSet<u16> = live
            .values()
            .flat_map(|sandbox| sandbox.ports.iter().map(|p| p.host_port))
            .collect();
        taken.extend(options.ports.iter().filter_map(PortMapping::fixed_host_port));

        options
            .ports
            .iter()
            .map(|mapping| {
                let host_port = match mapping.fixed_host_port() {
                    Some(port) => port,
                    None => {
                        let port = self.next_free_port(&taken)?;
                        taken.insert(port);
                        port
                    }
                };
                Ok(AssignedPort {
                    container_port: mapping.container_port,
                    host_port,
                    host_ip: "127.0.0.1".to_string(),
                    protocol: mapping.protocol,
                })
            })
            .collect()
    }

    fn next_free_port(&self, taken: &HashSet<u16>) -> Result<u16, SandboxError> {
        let span = usize::from(LAST_DYNAMIC_PORT - FIRST_DYNAMIC_PORT) + 1;
        for _ in 0..span {
            let port = self
                .next_port
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                    Some(if port >= LAST_DYNAMIC_PORT {
                        FIRST_DYNAMIC_PORT
                    } else {
                        port + 1
                    })
                })
                .unwrap_or_else(|current| current);
            if !taken.contains(&port) {
                return Ok(port);
            }
        }
        Err(SandboxError::resource_limit_exceeded(format!(
            "no free host port in {FIRST_DYNAMIC_PORT}-{LAST_DYNAMIC_PORT}"
        )))
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: CreateOptions,
    ) -> Result<Sandbox, SandboxError> {
        ctx.check()?;
        let _guard = ctx.run(async { Ok(self.locks.lock(session_id).await) }).await?;

        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(session_id) {
            return Err(SandboxError::already_exists(session_id));
        }
        if let Some(max) = self.max_sandboxes {
            if sandboxes.len() >= max {
                return Err(SandboxError::resource_limit_exceeded(format!(
                    "provider holds {max} sandboxes"
                )));
            }
        }

        let image = if options.image.is_empty() {
            self.default_image.clone()
        } else {
            options.image.clone()
        };
        if !is_valid_image_reference(&image) {
            return Err(SandboxError::invalid_image(image));
        }

        let mut sandbox = Sandbox::new(
            format!("mem-{}", uuid::Uuid::new_v4().simple()),
            session_id,
            image,
        );
        sandbox.project_id.clone_from(&options.project_id);
        sandbox.ports = self.assign_ports(&options, &sandboxes)?;
        sandbox.env = options.env;
        sandbox.metadata = options.labels;
        sandbox
            .metadata
            .insert("backend".to_string(), self.name().to_string());

        info!("Created sandbox {} for session {}", sandbox.id, session_id);
        sandboxes.insert(session_id.to_string(), sandbox.clone());
        Ok(sandbox)
    }

    async fn start(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError> {
        let _guard = ctx.run(async { Ok(self.locks.lock(session_id).await) }).await?;

        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        if sandbox.status.is_running() {
            return Err(SandboxError::already_running(session_id));
        }

        if let Some(message) = self.take_start_failure(session_id) {
            sandbox.mark_failed(message.clone());
            return Err(SandboxError::start_failed(message));
        }

        sandbox.mark_running();
        info!("Started sandbox for session {}", session_id);
        Ok(())
    }

    async fn stop(
        &self,
        ctx: &OpContext,
        session_id: &str,
        _timeout: Duration,
    ) -> Result<(), SandboxError> {
        let _guard = ctx.run(async { Ok(self.locks.lock(session_id).await) }).await?;

        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        if !sandbox.status.is_running() {
            return Err(SandboxError::not_running(session_id));
        }

        sandbox.mark_stopped();
        info!("Stopped sandbox for session {}", session_id);
        Ok(())
    }

    async fn remove(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError> {
        let _guard = ctx.run(async { Ok(self.locks.lock(session_id).await) }).await?;

        if self.sandboxes.write().await.remove(session_id).is_some() {
            info!("Removed sandbox for session {}", session_id);
        } else {
            debug!("Remove for unknown session {}, nothing to do", session_id);
        }
        Ok(())
    }

    async fn get(&self, ctx: &OpContext, session_id: &str) -> Result<Sandbox, SandboxError> {
        ctx.check()?;
        self.sandboxes
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(session_id))
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<Sandbox>, SandboxError> {
        ctx.check()?;
        Ok(self.sandboxes.read().await.values().cloned().collect())
    }

    async fn exec(
        &self,
        ctx: &OpContext,
        session_id: &str,
        cmd: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        ctx.check()?;
        if !self.sandboxes.read().await.contains_key(session_id) {
            return Err(SandboxError::not_found(session_id));
        }
        if cmd.is_empty() {
            return Err(SandboxError::exec_failed("empty command"));
        }
        debug!("Exec in session {}: {:?}", session_id, cmd);
        Ok((self.exec_handler)(cmd, &options))
    }

    async fn attach(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: AttachOptions,
    ) -> Result<Pty, SandboxError> {
        ctx.check()?;
        let sandboxes = self.sandboxes.read().await;
        let sandbox = sandboxes
            .get(session_id)
            .ok_or_else(|| SandboxError::not_found(session_id))?;
        if !sandbox.status.is_running() {
            return Err(SandboxError::not_running(session_id));
        }
        let (pty, _) = loopback_pty(options.rows, options.cols);
        Ok(pty)
    }
}

/// A tiny interpreter covering the commands tests reach for.
fn builtin_exec(cmd: &[String], options: &ExecOptions) -> ExecResult {
    let args = &cmd[1..];
    match cmd[0].as_str() {
        "true" => ExecResult::default(),
        "false" => ExecResult {
            exit_code: 1,
            ..Default::default()
        },
        "echo" => ExecResult {
            exit_code: 0,
            stdout: format!("{}\n", args.join(" ")).into_bytes(),
            stderr: Vec::new(),
        },
        "cat" => ExecResult {
            exit_code: 0,
            stdout: options.stdin.clone().unwrap_or_default(),
            stderr: Vec::new(),
        },
        "pwd" => ExecResult {
            exit_code: 0,
            stdout: format!("{}\n", options.working_dir.as_deref().unwrap_or("/")).into_bytes(),
            stderr: Vec::new(),
        },
        "printenv" => {
            let stdout = args
                .first()
                .and_then(|key| options.env.get(key))
                .map(|value| format!("{value}\n").into_bytes());
            match stdout {
                Some(stdout) => ExecResult {
                    exit_code: 0,
                    stdout,
                    stderr: Vec::new(),
                },
                None => ExecResult {
                    exit_code: 1,
                    ..Default::default()
                },
            }
        }
        other => ExecResult {
            exit_code: 127,
            stdout: Vec::new(),
            stderr: format!("{other}: command not found\n").into_bytes(),
        },
    }
}

/// Terminal geometry last applied to a loopback session.
pub(crate) type SharedSize = Arc<Mutex<(u16, u16)>>;

struct LoopbackControl {
    size: SharedSize,
    exit: watch::Receiver<Option<i64>>,
    stop: CancellationToken,
}

#[async_trait]
impl PtyControl for LoopbackControl {
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), SandboxError> {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = (rows, cols);
        Ok(())
    }

    async fn wait(&self) -> Result<i64, SandboxError> {
        let mut exit = self.exit.clone();
        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return Ok(code);
            }
            if exit.changed().await.is_err() {
                return (*exit.borrow())
                    .ok_or_else(|| SandboxError::attach_failed("terminal process vanished"));
            }
        }
    }

    async fn terminate(&self) {
        self.stop.cancel();
    }
}

/// Opens a loopback terminal: everything written is echoed back, and a line
/// `exit [code]` ends the session with that code.
pub(crate) fn loopback_pty(rows: u16, cols: u16) -> (Pty, SharedSize) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = watch::channel(None);
    let stop = CancellationToken::new();
    let size = Arc::new(Mutex::new((rows, cols)));

    let shell_stop = stop.clone();
    tokio::spawn(async move {
        let code = echo_shell(server, shell_stop).await;
        let _ = exit_tx.send(Some(code));
    });

    let (read_half, write_half) = tokio::io::split(client);
    let control = LoopbackControl {
        size: Arc::clone(&size),
        exit: exit_rx,
        stop,
    };
    (Pty::new(read_half, write_half, control), size)
}

async fn echo_shell(mut io: DuplexStream, stop: CancellationToken) -> i64 {
    let mut buf = vec![0u8; 4096];
    let mut line = Vec::new();
    loop {
        let n = tokio::select! {
            biased;
            () = stop.cancelled() => return 130,
            read = io.read(&mut buf) => match read {
                Ok(0) | Err(_) => return 0,
                Ok(n) => n,
            },
        };
        if io.write_all(&buf[..n]).await.is_err() {
            return 0;
        }
        line.extend_from_slice(&buf[..n]);
        while let Some(pos) = line.iter().position(|b| *b == b'\n') {
            let entered: Vec<u8> = line.drain(..=pos).collect();
            let entered = String::from_utf8_lossy(&entered);
            if let Some(rest) = entered.trim().strip_prefix("exit") {
                return rest.trim().parse().unwrap_or(0);
            }
        }
    }
}
