//! portferry - SSH port forwarding for many tunnels at once
//!
//! Reads a YAML file of SSH servers and tunnels, connects to every server
//! and keeps all tunnels running until Ctrl+C.

mod config;
mod sessions;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{ForwarderConfig, TunnelPlan, DEFAULT_CONFIG_FILE};
use portferry_forward::Forwarder;
use portferry_transport_ssh::{SshConfig, SshConnector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// portferry - Run SSH forward and reverse tunnels from one config file
#[derive(Parser, Debug)]
#[command(name = "portferry")]
#[command(about = "portferry - Run SSH forward and reverse tunnels from one config file")]
#[command(version = env!("PORTFERRY_VERSION"))]
#[command(long_version = concat!(env!("PORTFERRY_VERSION"), "\nCommit: ", env!("PORTFERRY_COMMIT"), "\nBuilt: ", env!("PORTFERRY_BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to every server and run all tunnels until Ctrl+C
    #[command(long_about = r#"
Connect to every SSH server referenced by a valid tunnel, then run all
tunnels until they stop or Ctrl+C is pressed.

A tunnel with an invalid entry, or whose server could not be reached or
authenticated, is skipped; the other tunnels still run.

EXAMPLES:
  # Use ./portferry.yml
  portferry run

  # Explicit config file, verbose logging
  portferry -v run --config /etc/portferry/tunnels.yml

ENVIRONMENT VARIABLES:
  PORTFERRY_CONFIG   Path to the configuration file
  RUST_LOG           Overrides the log filter (e.g. portferry_forward=debug)
    "#)]
    Run {
        /// Configuration file
        #[arg(short, long, env = "PORTFERRY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Seconds allowed for connecting and authenticating each server
        #[arg(long, default_value = "5")]
        connect_timeout: u64,
    },

    /// Validate the configuration without connecting
    Check {
        /// Configuration file
        #[arg(short, long, env = "PORTFERRY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Write an example configuration file
    Init {
        /// Where to write the file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Setup logging with the specified log level
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<ForwarderConfig> {
    ForwarderConfig::load(path).with_context(|| format!("Invalid configuration: {:?}", path))
}

/// Log every tunnel entry that failed validation
fn report_rejected(plan: &TunnelPlan) {
    for rejected in &plan.rejected {
        warn!(
            tunnel = rejected.index,
            server = %rejected.entry.server_name,
            error = %rejected.error,
            "Skipping invalid tunnel"
        );
    }
}

async fn run(config_path: &Path, connect_timeout: Duration) -> Result<()> {
    let config = load_config(config_path)?;
    let plan = config.plan();
    report_rejected(&plan);

    if plan.tunnels.is_empty() {
        warn!("No runnable tunnels configured, nothing to do");
        return Ok(());
    }

    let referenced = plan.referenced_servers();
    let servers: Vec<_> = config
        .servers()?
        .into_iter()
        .filter(|server| referenced.contains(server.name.as_str()))
        .collect();

    info!(
        config = ?config_path,
        servers = servers.len(),
        tunnels = plan.tunnels.len(),
        "Starting portferry"
    );

    let connector = SshConnector::new(SshConfig::default().with_connect_timeout(connect_timeout));
    let sessions = sessions::establish_all(&connector, &servers).await;

    let forwarder = Forwarder::new(sessions);
    let mut handle = forwarder.spawn(plan.tunnels);

    // Run until every tunnel stops on its own or Ctrl+C
    let finished = tokio::select! {
        report = handle.wait() => Some(report),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
            None
        }
    };

    let report = match finished {
        Some(report) => report,
        None => {
            info!("Received Ctrl+C, shutting down...");
            handle.shutdown();
            handle.wait().await
        }
    };

    forwarder.close_sessions().await;
    info!(report = %report, "portferry stopped");
    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let servers = config.servers()?;
    let plan = config.plan();

    println!("Configuration: {}", config_path.display());
    println!();
    println!("SSH servers:");
    for server in &servers {
        let auth = match (&server.credentials.key_file, &server.credentials.password) {
            (Some(_), Some(_)) => "key, password",
            (Some(_), None) => "key",
            (None, Some(_)) => "password",
            (None, None) => "none (will fail)",
        };
        println!(
            "  {} -> {}@{} (auth: {})",
            server.name,
            server.user,
            server.address(),
            auth
        );
    }

    println!();
    println!("Tunnels:");
    for spec in &plan.tunnels {
        if servers.iter().any(|s| s.name == spec.session_name) {
            println!("  ✓ {}", spec);
        } else {
            println!("  ✗ {} (server '{}' is not defined)", spec, spec.session_name);
        }
    }
    for rejected in &plan.rejected {
        println!("  ✗ tunnel #{}: {}", rejected.index + 1, rejected.error);
    }

    println!();
    println!(
        "{} tunnel(s) valid, {} rejected",
        plan.tunnels.len(),
        plan.rejected.len()
    );
    Ok(())
}

fn init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    std::fs::write(output, ForwarderConfig::template())
        .with_context(|| format!("Failed to write config file: {:?}", output))?;

    println!("Wrote example configuration to {}", output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            connect_timeout,
        } => run(&config, Duration::from_secs(connect_timeout)).await,
        Commands::Check { config } => check(&config),
        Commands::Init { output, force } => init(&output, force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["portferry", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                config,
                connect_timeout,
            } => {
                // PORTFERRY_CONFIG may be set in the environment
                if std::env::var_os("PORTFERRY_CONFIG").is_none() {
                    assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_FILE));
                }
                assert_eq!(connect_timeout, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_verbose_after_subcommand() {
        let cli =
            Cli::try_parse_from(["portferry", "check", "--config", "tunnels.yml", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Check { config } if config == PathBuf::from("tunnels.yml")));
    }

    #[test]
    fn test_init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portferry.yml");

        init(&path, false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, ForwarderConfig::template());

        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
    }

    #[test]
    fn test_check_reports_whole_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portferry.yml");
        std::fs::write(
            &path,
            "ssh_servers:\n  - name: gw\n    host: gw.example.com\n    port: nope\n    user: u\n",
        )
        .unwrap();
        assert!(check(&path).is_err());

        std::fs::write(&path, ForwarderConfig::template()).unwrap();
        assert!(check(&path).is_ok());
    }

    #[tokio::test]
    async fn test_run_without_tunnels_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portferry.yml");
        std::fs::write(&path, "ssh_servers: []\ntunnels: []\n").unwrap();

        tokio::time::timeout(Duration::from_secs(5), run(&path, Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
    }
}
