use std::time::Duration;

use async_trait::async_trait;

use super::{
    AttachOptions, CreateOptions, ExecOptions, ExecResult, OpContext, Pty, Sandbox, SandboxError,
};

/// The backend-agnostic sandbox lifecycle and I/O contract.
///
/// One implementation per backend; callers hold `Arc<dyn Provider>` and
/// never depend on a concrete backend. Operations on different sessions may
/// run concurrently; operations on the same session are serialized.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name for display and logging.
    fn name(&self) -> &'static str;

    /// Creates (but does not start) the sandbox for `session_id`.
    ///
    /// Fails with `AlreadyExists` if one exists. Requested ports are always
    /// realized in the returned sandbox, with host port 0 assigned by the
    /// backend.
    async fn create(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: CreateOptions,
    ) -> Result<Sandbox, SandboxError>;

    /// Starts the sandbox. On backend failure the sandbox is marked failed
    /// and `StartFailed` is returned.
    async fn start(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError>;

    /// Stops a running sandbox, force-terminating after `timeout`.
    async fn stop(
        &self,
        ctx: &OpContext,
        session_id: &str,
        timeout: Duration,
    ) -> Result<(), SandboxError>;

    /// Removes the sandbox and its exclusive resources. Removing a sandbox
    /// that does not exist succeeds.
    async fn remove(&self, ctx: &OpContext, session_id: &str) -> Result<(), SandboxError>;

    /// Returns a snapshot of the sandbox.
    async fn get(&self, ctx: &OpContext, session_id: &str) -> Result<Sandbox, SandboxError>;

    /// Returns snapshots of every tracked sandbox, in no particular order.
    async fn list(&self, ctx: &OpContext) -> Result<Vec<Sandbox>, SandboxError>;

    /// Runs `cmd` to completion and captures its output.
    async fn exec(
        &self,
        ctx: &OpContext,
        session_id: &str,
        cmd: &[String],
        options: ExecOptions,
    ) -> Result<ExecResult, SandboxError>;

    /// Opens an interactive terminal. Requires a running sandbox.
    async fn attach(
        &self,
        ctx: &OpContext,
        session_id: &str,
        options: AttachOptions,
    ) -> Result<Pty, SandboxError>;
}
