//! Accelerator commands: ensure, remove, reconcile.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tracing::{info, warn};

use hatch::buildkit::{self, BuildKit, ReconcileReport};
use hatch::config::Config;
use hatch::engine::DockerEngine;
use hatch::sandbox::OpContext;

async fn orchestrator(config: &Config) -> Result<BuildKit<DockerEngine>> {
    let Some(settings) = config.buildkit_config() else {
        bail!("BuildKit accelerators are disabled in the configuration ([buildkit] enabled = false)");
    };
    let engine = DockerEngine::connect()
        .await
        .context("Cannot reach the Docker daemon. Is Docker running?")?;
    Ok(BuildKit::new(Arc::new(engine), settings))
}

/// Format a reconcile report for display
pub fn format_report(report: &ReconcileReport) -> String {
    let mut out = String::new();

    if report.removed.is_empty() && report.failed.is_empty() {
        let _ = writeln!(
            out,
            "{} {} accelerator(s) checked, all current.",
            "✓".green(),
            report.inspected
        );
        return out;
    }

    for name in &report.removed {
        let _ = writeln!(out, "  {} removed {}", "✓".green(), name);
    }
    for (name, reason) in &report.failed {
        let _ = writeln!(out, "  {} {}: {}", "✗".red(), name, reason.red());
    }
    let _ = writeln!(
        out,
        "{} checked, {} removed, {} failed",
        report.inspected,
        report.removed.len(),
        report.failed.len()
    );
    out
}

pub async fn ensure(config: &Config, project: &str) -> Result<()> {
    let orchestrator = orchestrator(config).await?;
    let name = orchestrator
        .ensure(&OpContext::background(), project)
        .await
        .with_context(|| format!("Failed to ensure accelerator for project {project}"))?;
    println!("{} Accelerator {} is running", "✓".green(), name.cyan());
    println!(
        "  {} {}",
        "network".dimmed(),
        buildkit::network_name(project)
    );
    println!(
        "  {} {}",
        "BUILDKIT_HOST".dimmed(),
        orchestrator.endpoint(project)
    );
    Ok(())
}

pub async fn remove(config: &Config, project: &str) -> Result<()> {
    let orchestrator = orchestrator(config).await?;
    orchestrator
        .remove(&OpContext::background(), project)
        .await
        .with_context(|| format!("Failed to remove accelerator for project {project}"))?;
    println!(
        "{} Removed accelerator and network for project {} (cache volume {} kept)",
        "✓".green(),
        project.cyan(),
        buildkit::volume_name(project)
    );
    Ok(())
}

/// Reconcile once, or every `interval` seconds until interrupted
pub async fn reconcile(config: &Config, interval: Option<u64>) -> Result<()> {
    let orchestrator = orchestrator(config).await?;
    let ctx = OpContext::background();

    let Some(interval) = interval else {
        let report = orchestrator
            .reconcile(&ctx)
            .await
            .context("Failed to reconcile accelerators")?;
        print!("{}", format_report(&report));
        return Ok(());
    };

    if interval == 0 {
        bail!("--interval must be at least 1 second");
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    info!("Reconciling accelerators every {}s", interval);

    let stop = ctx.child();
    let watcher = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match orchestrator.reconcile(&stop).await {
            Ok(report) => print!("{}", format_report(&report)),
            Err(err) if err.is_cancelled() => break,
            Err(err) => warn!("Reconcile failed: {}", err),
        }
    }

    info!("Reconcile loop stopped");
    Ok(())
}
