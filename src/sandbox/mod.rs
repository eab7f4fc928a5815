//! Sandbox provider contract and backends.
//!
//! A sandbox is one isolated execution environment bound to a session.
//! Callers depend on the [`Provider`] trait only; backends live in
//! submodules:
//! - `memory`: in-process reference implementation
//! - `container`: container-engine backend (`DockerProvider` over Docker)

mod container;
mod context;
mod error;
mod locks;
mod memory;
mod provider;
mod pty;
mod types;

pub use container::{ContainerProvider, ContainerProviderConfig, DockerProvider};
pub use context::OpContext;
pub use error::SandboxError;
pub use locks::{SessionGuard, SessionLocks};
pub use memory::{ExecHandler, MemoryProvider};
pub use provider::Provider;
pub use pty::{Pty, PtyControl};
pub use types::{
    env_pairs, is_valid_image_reference, AssignedPort, AttachOptions, CreateOptions, ExecOptions,
    ExecResult, PortMapping, Protocol, ResourceLimits, Sandbox, SandboxStatus, StorageConfig,
};

#[cfg(test)]
pub(crate) use memory::loopback_pty;
