use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hatch::config::{LogFormat, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(name = "hatch")]
#[command(
    author,
    version,
    about = "Per-session sandboxes with shared per-project BuildKit caches"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./hatch.toml when present)
    #[arg(long, global = true, env = "HATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List sandboxes managed on this Docker host
    List,

    /// Create a sandbox for a session
    Create {
        /// Session id (generated when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Image (defaults to sandbox.image)
        #[arg(short, long)]
        image: Option<String>,

        /// Project whose BuildKit accelerator and network the sandbox joins
        #[arg(long)]
        project: Option<String>,

        /// Publish a port: CONTAINER, HOST:CONTAINER, optionally /udp
        #[arg(short, long = "port")]
        ports: Vec<String>,

        /// Environment variable KEY=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Start the sandbox after creating it
        #[arg(long)]
        start: bool,
    },

    /// Start a created or stopped sandbox
    Start {
        /// Session id
        session: String,
    },

    /// Run a command in a sandbox and exit with its code
    Exec {
        /// Session id
        session: String,

        /// Command line, split with shell quoting rules
        #[arg(short, long, conflicts_with = "args")]
        command: Option<String>,

        /// Working directory inside the sandbox
        #[arg(short, long)]
        workdir: Option<String>,

        /// Command and arguments, after `--`
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Stop a running sandbox
    Stop {
        /// Session id
        session: String,

        /// Seconds to wait before killing (defaults to sandbox.stop_timeout_secs)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Remove a sandbox
    Remove {
        /// Session id
        session: String,
    },

    /// Manage per-project BuildKit accelerators
    Buildkit {
        #[command(subcommand)]
        action: BuildkitCommands,
    },
}

#[derive(Subcommand)]
enum BuildkitCommands {
    /// Create or repair a project's accelerator
    Ensure {
        /// Project id
        project: String,
    },

    /// Remove a project's accelerator and network (the cache volume is kept)
    Remove {
        /// Project id
        project: String,
    },

    /// Remove accelerators running an outdated image
    Reconcile {
        /// Repeat every N seconds until interrupted
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("hatch=debug")
        } else {
            EnvFilter::new("hatch=info")
        }
    });

    let (text, json) = match logging.format {
        LogFormat::Text => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    let (file, guard) = match &logging.file {
        Some(path) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {path}"))?;
            let (writer, guard) = tracing_appender::non_blocking(log_file);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(file)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref())?;
    let guard = init_logging(cli.verbose, &config.logging)?;

    match cli.command {
        Commands::List => {
            commands::sandbox::list(&config).await?;
        }
        Commands::Create {
            session,
            image,
            project,
            ports,
            env,
            start,
        } => {
            let args = commands::sandbox::CreateArgs {
                session,
                image,
                project,
                ports,
                env,
                start,
            };
            commands::sandbox::create(&config, args).await?;
        }
        Commands::Start { session } => {
            commands::sandbox::start(&config, &session).await?;
        }
        Commands::Exec {
            session,
            command,
            workdir,
            args,
        } => {
            let code =
                commands::sandbox::exec(&config, &session, &args, command.as_deref(), workdir)
                    .await?;
            if code != 0 {
                drop(guard);
                std::process::exit(code);
            }
        }
        Commands::Stop { session, timeout } => {
            commands::sandbox::stop(&config, &session, timeout).await?;
        }
        Commands::Remove { session } => {
            commands::sandbox::remove(&config, &session).await?;
        }
        Commands::Buildkit { action } => match action {
            BuildkitCommands::Ensure { project } => {
                commands::buildkit::ensure(&config, &project).await?;
            }
            BuildkitCommands::Remove { project } => {
                commands::buildkit::remove(&config, &project).await?;
            }
            BuildkitCommands::Reconcile { interval } => {
                commands::buildkit::reconcile(&config, interval).await?;
            }
        },
    }

    Ok(())
}
