//! Sandbox lifecycle commands: list, create, start, exec, stop, remove.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use hatch::config::Config;
use hatch::sandbox::{
    CreateOptions, ExecOptions, OpContext, PortMapping, Protocol, Provider, Sandbox,
    SandboxStatus,
};

/// Parse a port spec: `8080`, `18080:8080`, optionally suffixed `/udp`
pub fn parse_port(spec: &str) -> Result<PortMapping> {
    let (ports, protocol) = match spec.split_once('/') {
        Some((ports, proto)) => (
            ports,
            proto.parse::<Protocol>().map_err(anyhow::Error::msg)?,
        ),
        None => (spec, Protocol::Tcp),
    };

    let (host, container) = match ports.split_once(':') {
        Some((host, container)) => (Some(host), container),
        None => (None, ports),
    };

    let container_port: u16 = container
        .parse()
        .with_context(|| format!("Invalid container port in '{spec}'"))?;
    let host_port = host
        .map(|h| h.parse::<u16>())
        .transpose()
        .with_context(|| format!("Invalid host port in '{spec}'"))?;

    Ok(PortMapping {
        container_port,
        host_port,
        protocol,
    })
}

/// Parse `KEY=VALUE` pairs into a map
pub fn parse_env(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("Invalid environment variable '{pair}', expected KEY=VALUE"),
        })
        .collect()
}

/// Build the argv to run: either the trailing args, or a command line split
/// with shell quoting rules
pub fn command_argv(args: &[String], command_line: Option<&str>) -> Result<Vec<String>> {
    let argv = match command_line {
        Some(line) => shell_words::split(line).context("Invalid command line")?,
        None => args.to_vec(),
    };
    if argv.is_empty() {
        bail!("No command given");
    }
    Ok(argv)
}

fn status_label(status: SandboxStatus) -> colored::ColoredString {
    match status {
        SandboxStatus::Running => status.to_string().green().bold(),
        SandboxStatus::Created => status.to_string().cyan(),
        SandboxStatus::Stopped => status.to_string().dimmed(),
        SandboxStatus::Failed => status.to_string().red().bold(),
    }
}

fn format_ports(sandbox: &Sandbox) -> String {
    sandbox
        .ports
        .iter()
        .map(|p| {
            format!(
                "{}:{}->{}/{}",
                p.host_ip, p.host_port, p.container_port, p.protocol
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format sandboxes as a table, sorted by session
pub fn format_table(sandboxes: &[Sandbox]) -> String {
    let mut out = String::new();

    if sandboxes.is_empty() {
        let _ = writeln!(out, "\n{} No sandboxes found.", "ℹ".blue());
        return out;
    }

    let mut sorted: Vec<&Sandbox> = sandboxes.iter().collect();
    sorted.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    let _ = writeln!(
        out,
        "{:<24} {:<10} {:<28} {:<12} {}",
        "SESSION".bold(),
        "STATUS".bold(),
        "IMAGE".bold(),
        "PROJECT".bold(),
        "PORTS".bold()
    );
    for sandbox in sorted {
        let _ = writeln!(
            out,
            "{:<24} {:<10} {:<28} {:<12} {}",
            sandbox.session_id,
            status_label(sandbox.status),
            sandbox.image,
            sandbox.project_id.as_deref().unwrap_or("-"),
            format_ports(sandbox)
        );
        if let Some(error) = &sandbox.error {
            let _ = writeln!(out, "  {} {}", "✗".red(), error.red());
        }
    }
    out
}

pub async fn list(config: &Config) -> Result<()> {
    let provider = super::connect(config).await?;
    let sandboxes = provider.list(&OpContext::background()).await?;
    print!("{}", format_table(&sandboxes));
    Ok(())
}

pub struct CreateArgs {
    pub session: Option<String>,
    pub image: Option<String>,
    pub project: Option<String>,
    pub ports: Vec<String>,
    pub env: Vec<String>,
    pub start: bool,
}

pub async fn create(config: &Config, args: CreateArgs) -> Result<()> {
    let ports = args
        .ports
        .iter()
        .map(|p| parse_port(p))
        .collect::<Result<Vec<_>>>()?;
    let options = CreateOptions {
        image: args.image.unwrap_or_default(),
        env: parse_env(&args.env)?,
        ports,
        project_id: args.project,
        ..Default::default()
    };
    let session = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let provider = super::connect(config).await?;
    let ctx = OpContext::background();
    let sandbox = provider
        .create(&ctx, &session, options)
        .await
        .with_context(|| format!("Failed to create sandbox for session {session}"))?;
    println!(
        "{} Created sandbox {} for session {}",
        "✓".green(),
        sandbox.id.chars().take(12).collect::<String>().cyan(),
        session.cyan()
    );

    if args.start {
        provider
            .start(&ctx, &session)
            .await
            .with_context(|| format!("Failed to start sandbox for session {session}"))?;
        println!("{} Started", "✓".green());
    }

    for port in &sandbox.ports {
        println!(
            "  {} {}:{} -> {}/{}",
            "port".dimmed(),
            port.host_ip,
            port.host_port,
            port.container_port,
            port.protocol
        );
    }
    Ok(())
}

pub async fn start(config: &Config, session: &str) -> Result<()> {
    let provider = super::connect(config).await?;
    provider
        .start(&OpContext::background(), session)
        .await
        .with_context(|| format!("Failed to start sandbox for session {session}"))?;
    println!("{} Started sandbox for session {}", "✓".green(), session.cyan());
    Ok(())
}

/// Run a command and return its exit code
pub async fn exec(
    config: &Config,
    session: &str,
    args: &[String],
    command_line: Option<&str>,
    workdir: Option<String>,
) -> Result<i32> {
    let argv = command_argv(args, command_line)?;
    let provider = super::connect(config).await?;
    let result = provider
        .exec(
            &OpContext::background(),
            session,
            &argv,
            ExecOptions {
                working_dir: workdir,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to exec in session {session}"))?;

    print!("{}", result.stdout_lossy());
    eprint!("{}", result.stderr_lossy());
    Ok(i32::try_from(result.exit_code).unwrap_or(1))
}

pub async fn stop(config: &Config, session: &str, timeout: Option<u64>) -> Result<()> {
    let timeout = timeout.map_or_else(|| config.stop_timeout(), Duration::from_secs);
    let provider = super::connect(config).await?;
    provider
        .stop(&OpContext::background(), session, timeout)
        .await
        .with_context(|| format!("Failed to stop sandbox for session {session}"))?;
    println!("{} Stopped sandbox for session {}", "✓".green(), session.cyan());
    Ok(())
}

pub async fn remove(config: &Config, session: &str) -> Result<()> {
    let provider = super::connect(config).await?;
    provider
        .remove(&OpContext::background(), session)
        .await
        .with_context(|| format!("Failed to remove sandbox for session {session}"))?;
    println!("{} Removed sandbox for session {}", "✓".green(), session.cyan());
    Ok(())
}
