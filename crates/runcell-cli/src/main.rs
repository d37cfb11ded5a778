//! Runcell CLI
//!
//! A command-line tool for running one command in a single-shot sandbox.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runcell::{
    Config, EXAMPLE_CONFIG, ExecuteError, ExecutionConfig, NativeBackend, Runner, cancellation,
};
use tokio::io::AsyncReadExt;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used when the run was interrupted
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "runcell")]
#[command(about = "A tool for running a command in a single-shot sandbox")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: runcell.toml)
        #[arg(short, long, default_value = "runcell.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run an execution config and print the report as JSON
    Run {
        /// Execution config (JSON, TOML or YAML); read as JSON from stdin if omitted
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Show current configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // stdout carries the report, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run { file } => run(config, file.as_deref()).await,
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run(config: Config, file: Option<&Path>) -> Result<()> {
    let exec = match file {
        Some(path) => {
            ExecutionConfig::from_file(path).context("failed to load execution config")?
        }
        None => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("failed to read execution config from stdin")?;
            ExecutionConfig::from_json(&input).context("failed to parse execution config")?
        }
    };

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling execution");
            handle.cancel();
        }
    });

    info!(command = ?exec.command, "running");
    let runner = Runner::new(config, NativeBackend::new());

    match runner.run(&exec, signal).await {
        Ok(report) => {
            let json =
                serde_json::to_string_pretty(&report).context("failed to serialize report")?;
            println!("{json}");
            Ok(())
        }
        Err(ExecuteError::Cancelled) => {
            eprintln!("Execution cancelled");
            std::process::exit(EXIT_CANCELLED);
        }
        Err(e) => Err(e).context("execution failed"),
    }
}

fn show_config(config: &Config) {
    println!("Cgroup root: {}", config.cgroup_root.display());
    println!(
        "Safety net: {}x time limit, {} ms without one",
        config.safety_net_multiplier, config.default_deadline_ms
    );
    println!();
    println!("Sandbox identity: {}:{}", config.sandbox_uid, config.sandbox_gid);
    println!("Hostname: {}", config.hostname);
    println!("PATH: {}", config.system_path);
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
