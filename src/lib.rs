//! Per-session sandboxes for coding agents, with a shared BuildKit
//! accelerator and isolated network per project.
//!
//! Callers program against [`sandbox::Provider`]. [`sandbox::MemoryProvider`]
//! is the in-process reference backend; [`sandbox::DockerProvider`] runs each
//! sandbox as a Docker container and provisions accelerators through
//! [`buildkit::BuildKit`].

pub mod buildkit;
pub mod config;
pub mod engine;
pub mod sandbox;
