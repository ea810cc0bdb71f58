use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::Outcome;
use fleetwright_config::Config;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod atomic;
mod canary;
mod canary_state;
mod commands;
mod env_loader;
mod history;
mod output;
mod paths;
mod rolling;
mod runtime;
mod theme;

#[derive(Parser)]
#[command(name = "fleetwright")]
#[command(about = "Zero-downtime deployment orchestrator for containerized services over SSH")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(
        long,
        global = true,
        help = "Configuration file path (default: ./fleetwright.toml in current directory)"
    )]
    config: Option<String>,

    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,

    #[arg(long, global = true, help = "Suppress human-readable output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Environment overlay (loads fleetwright.<env>.toml)"
    )]
    env: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Roll out a new version host by host")]
    Deploy {
        #[arg(long, help = "Image tag to deploy")]
        version: Option<String>,
        #[arg(long, help = "Skip the image pull preflight")]
        skip_pull: bool,
        #[arg(long, help = "Restrict the rollout to these hosts", num_args = 1..)]
        host: Option<Vec<String>>,
        #[arg(long, help = "Restrict the rollout to these server roles", num_args = 1..)]
        role: Option<Vec<String>>,
    },
    #[command(about = "Redeploy the last successfully deployed version")]
    Redeploy,
    #[command(about = "Roll back to a specific version")]
    Rollback {
        #[arg(help = "Version to roll back to")]
        version: String,
    },
    #[command(about = "Start the service's containers without a deploy")]
    Start {
        #[arg(long, help = "Restrict to these hosts", num_args = 1..)]
        host: Option<Vec<String>>,
    },
    #[command(about = "Stop the service's containers")]
    Stop {
        #[arg(long, help = "Restrict to these hosts", num_args = 1..)]
        host: Option<Vec<String>>,
    },
    #[command(about = "Stop then start the service's containers")]
    Restart {
        #[arg(long, help = "Restrict to these hosts", num_args = 1..)]
        host: Option<Vec<String>>,
    },
    #[command(about = "Canary deployment commands")]
    Canary {
        #[command(subcommand)]
        command: CanaryCommands,
    },
    #[command(about = "Deployment history commands")]
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Subcommand)]
enum CanaryCommands {
    #[command(about = "Deploy a canary alongside the stable version")]
    Deploy {
        #[arg(long, help = "Image tag to deploy as the canary")]
        version: String,
        #[arg(long, help = "Initial percentage of traffic sent to the canary")]
        weight: Option<u8>,
    },
    #[command(about = "Promote the running canary to stable")]
    Promote,
    #[command(about = "Roll back and remove the running canary")]
    Rollback,
    #[command(about = "Show the current canary state")]
    Status,
    #[command(about = "Adjust the canary's traffic weight")]
    Weight {
        #[arg(help = "Percentage of traffic to send to the canary")]
        weight: u8,
    },
}

#[derive(Subcommand)]
enum HistoryCommands {
    #[command(about = "List recorded deployments")]
    List {
        #[arg(long, help = "List history across every service, not just the configured one")]
        all: bool,
        #[arg(long, help = "Show at most this many most-recent records")]
        limit: Option<usize>,
    },
    #[command(about = "Show one deployment record by id")]
    Show {
        #[arg(help = "Deployment id")]
        id: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_loader::load_fleetwright_env();

    let cli = Cli::parse();
    if let Some(env_name) = &cli.env {
        std::env::set_var("AZUD_ENV", env_name);
    }
    output::configure(cli.json, cli.quiet);

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.json || cli.quiet {
        Level::ERROR
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: tracing subscriber already set");
    }

    info!("fleetwright CLI v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(Outcome::Success) => ExitCode::from(0),
        Ok(Outcome::HostFailure) => ExitCode::from(1),
        Err(err) => {
            output::error_line(format!("error: {err:#}"));
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| "fleetwright.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    let repo_root = std::env::current_dir().context("failed to resolve current directory")?;
    std::fs::create_dir_all(paths::state_dir(&repo_root))
        .context("failed to create local state directory")?;

    match cli.command {
        Commands::Deploy {
            version,
            skip_pull,
            host,
            role,
        } => {
            commands::deploy::deploy(
                &config,
                &repo_root,
                commands::deploy::DeployArgs {
                    version,
                    skip_pull,
                    hosts: host,
                    roles: role,
                },
            )
            .await
        }
        Commands::Redeploy => commands::deploy::redeploy(&config, &repo_root).await,
        Commands::Rollback { version } => {
            commands::deploy::rollback(&config, &repo_root, version).await
        }
        Commands::Start { host } => commands::lifecycle::start(&config, host).await,
        Commands::Stop { host } => commands::lifecycle::stop(&config, host).await,
        Commands::Restart { host } => commands::lifecycle::restart(&config, host).await,
        Commands::Canary { command } => match command {
            CanaryCommands::Deploy { version, weight } => {
                commands::canary::deploy(&config, &repo_root, version, weight).await
            }
            CanaryCommands::Promote => commands::canary::promote(&config, &repo_root).await,
            CanaryCommands::Rollback => commands::canary::rollback(&config, &repo_root).await,
            CanaryCommands::Status => commands::canary::status(&config, &repo_root).await,
            CanaryCommands::Weight { weight } => {
                commands::canary::weight(&config, &repo_root, weight).await
            }
        },
        Commands::History { command } => match command {
            HistoryCommands::List { all, limit } => {
                commands::history::list(&config, &repo_root, all, limit)
            }
            HistoryCommands::Show { id } => commands::history::show(&repo_root, id),
        },
    }
}
