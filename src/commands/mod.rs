//! CLI command implementations.
//!
//! Each submodule keeps parsing and formatting pure and testable; Docker
//! is only touched after arguments are validated.

pub mod buildkit;
pub mod sandbox;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use hatch::config::Config;
use hatch::engine::DockerEngine;
use hatch::sandbox::{DockerProvider, OpContext};

/// Connects to Docker and loads every sandbox it already runs.
pub async fn connect(config: &Config) -> Result<DockerProvider> {
    let engine = DockerEngine::connect()
        .await
        .context("Cannot reach the Docker daemon. Is Docker running?")?;
    let provider = DockerProvider::new(Arc::new(engine), config.provider_config()?);
    let recovered = provider
        .recover(&OpContext::background())
        .await
        .context("Failed to list existing sandboxes")?;
    debug!("Recovered {} sandboxes", recovered);
    Ok(provider)
}

/// Loads `--config` if given, otherwise `hatch.toml` from the working directory.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_file(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Config::load(&cwd)
        }
    }
}
