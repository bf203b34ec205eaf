//! Dockbridge Daemon
//!
//! Bridges browser clients onto container-runtime daemons.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use daemon::config::{default_config_path, Config};
use daemon::docker::{HostRegistry, RegistryConfig};
use daemon::hosts::{HostEndpoint, HostStore, TcpTarget, TlsMaterial};
use daemon::server::{serve, AppState};
use daemon::session::SessionManager;

/// Dockbridge daemon - browser bridge to container-runtime hosts.
#[derive(Parser, Debug)]
#[command(name = "dockbridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Start the Dockbridge daemon
    Start {
        /// Listen address override (e.g. 0.0.0.0:7180)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Validate the configuration file and exit
    CheckConfig,

    /// Manage configured hosts
    #[command(subcommand)]
    Hosts(HostsCommands),
}

/// Subcommands for host management.
#[derive(Subcommand, Debug, Clone)]
enum HostsCommands {
    /// List configured hosts
    List,

    /// Add a host endpoint
    Add {
        /// Display name for the host
        name: String,

        /// Daemon address (host), omit for the local socket
        #[arg(long)]
        host: Option<String>,

        /// Daemon port
        #[arg(long)]
        port: Option<u16>,

        /// CA certificate file (PEM)
        #[arg(long)]
        ca_file: Option<PathBuf>,

        /// Client certificate file (PEM)
        #[arg(long)]
        cert_file: Option<PathBuf>,

        /// Client key file (PEM, PKCS#8)
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Remove a host endpoint
    Remove {
        /// Name of the host to remove
        name: String,
    },

    /// Make a host the active default
    Use {
        /// Name of the host to activate
        name: String,
    },
}

/// Initializes tracing to stderr plus a daily-rolled file under the data
/// directory. The returned guard must stay alive for the daemon's lifetime
/// so buffered log lines are flushed.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("daemon={level},protocol={level}"))
    });

    let log_dir = config.daemon.data_dir.join("logs");
    match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, "dockbridge.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_writer.and(std::io::stderr))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            tracing::warn!(error = %e, "file logging disabled");
            None
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default_from(&path)?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid configuration at {}", path.display()))?;
    Ok(config)
}

fn host_store(config: &Config) -> anyhow::Result<Arc<HostStore>> {
    let path = config.daemon.data_dir.join("hosts.toml");
    Ok(Arc::new(HostStore::load_or_default(path)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command.clone() {
        Commands::Start { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
                config.validate().context("invalid listen address")?;
            }
            let _log_guard = init_tracing(&config, cli.verbose);
            run_daemon(config).await
        }
        Commands::CheckConfig => {
            let path = cli.config.clone().unwrap_or_else(default_config_path);
            println!("configuration ok ({})", path.display());
            Ok(())
        }
        Commands::Hosts(command) => run_hosts_command(&config, command),
    }
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let hosts = host_store(&config)?;
    let registry = HostRegistry::new(RegistryConfig {
        connect_timeout: config.connect_timeout(),
        idle_timeout: config.idle_timeout(),
    });
    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        Arc::clone(&hosts),
        config.session.max_sessions,
    ));

    registry.start_sweep_task(config.sweep_interval());
    manager.start_sweep_task(config.sweep_interval());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                manager.shutdown_all();
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        manager,
        hosts,
        registry,
    };
    serve(&config, state, shutdown).await
}

fn run_hosts_command(config: &Config, command: HostsCommands) -> anyhow::Result<()> {
    let store = host_store(config)?;
    match command {
        HostsCommands::List => {
            let active = store.active_name();
            let hosts = store.list();
            if hosts.is_empty() {
                println!("no hosts configured");
                return Ok(());
            }
            for host in hosts {
                let marker = if active.as_deref() == Some(host.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {}", host.label());
            }
            Ok(())
        }
        HostsCommands::Add {
            name,
            host,
            port,
            ca_file,
            cert_file,
            key_file,
        } => {
            let address = match (host, port) {
                (Some(host), Some(port)) => Some(TcpTarget { host, port }),
                (None, None) => None,
                _ => anyhow::bail!("--host and --port must be provided together"),
            };
            let tls = match (cert_file, key_file) {
                (Some(cert_file), Some(key_file)) => Some(TlsMaterial {
                    ca_file,
                    cert_file,
                    key_file,
                }),
                (None, None) => None,
                _ => anyhow::bail!("--cert-file and --key-file must be provided together"),
            };
            let endpoint = HostEndpoint { name: name.clone(), address, tls };
            let label = endpoint.label();
            store.add(endpoint)?;
            println!("added {label}");
            Ok(())
        }
        HostsCommands::Remove { name } => {
            if store.remove(&name)? {
                println!("removed {name}");
            } else {
                anyhow::bail!("no host named '{name}'");
            }
            Ok(())
        }
        HostsCommands::Use { name } => {
            if store.set_active(&name)? {
                println!("active host is now {name}");
            } else {
                anyhow::bail!("no host named '{name}'");
            }
            Ok(())
        }
    }
}
