//! svcd - service orchestration core
//!
//! Supervises worker processes over local sockets and speaks the JSON
//! action protocol shared by every service of a session.
//!
//! ## Modes
//!
//! **`svcd send`**: starts a worker through a supervisor, sends one request
//! document and prints the response.
//!
//! **`svcd worker`**: the worker side. Connects to the endpoint given in
//! `SVCD_WORKER_ENDPOINT` and answers `Echo` requests. This is what `send`
//! launches when no worker executable is configured.

use clap::{Parser as ClapParser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use svcd::{
    config::{self, ConfigError, OrchestratorConfig},
    message::ReturnMessage,
    port::{PortAllocator, PortError},
    supervisor::{SubprocessSupervisor, SupervisorConfig},
    worker::{self, EchoHandler, ServeEnd, ENDPOINT_ENV},
};

/// svcd - service orchestration core
#[derive(ClapParser, Debug)]
#[command(name = "svcd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "SVCD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a worker connected to a supervisor's endpoint
    Worker {
        /// Endpoint socket path
        #[arg(long, env = ENDPOINT_ENV)]
        endpoint: PathBuf,
    },

    /// Send one request document to a supervised worker and print the response
    Send {
        /// JSON request document, e.g. '{"Action":"Echo","Value":"hi"}'
        document: String,

        /// Session the worker belongs to
        #[arg(long, default_value = "default")]
        session: String,

        /// Worker type (overrides config)
        #[arg(long)]
        worker_type: Option<String>,

        /// Worker executable (overrides config; defaults to `svcd worker`)
        #[arg(long)]
        executable: Option<PathBuf>,

        /// Response timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Tear the worker down after the request
        #[arg(long)]
        single: bool,
    },

    /// Allocate and print ports
    Ports {
        /// Number of ports to allocate
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// First port to consider (overrides config)
        #[arg(long)]
        base: Option<u16>,

        /// Address used for probing (overrides config)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Skip ports already bound by other processes
        #[arg(long)]
        probe: bool,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration to the config path
        #[arg(long)]
        save: bool,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("port error: {0}")]
    Port(#[from] PortError),

    #[error("invalid request document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    // Worker stdout may be attached to the supervisor; keep logs on stderr.
    if matches!(cli.command, Commands::Worker { .. }) {
        init_tracing_stderr();
    } else {
        init_tracing();
    }

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Worker { endpoint } => run_worker(endpoint).await,
        Commands::Send {
            document,
            session,
            worker_type,
            executable,
            timeout_ms,
            single,
        } => {
            let mut config = OrchestratorConfig::load_or_default(&config_path)?;
            if let Some(worker_type) = worker_type {
                config.worker.worker_type = worker_type;
            }
            if let Some(executable) = executable {
                config.worker.executable = Some(executable);
            }
            if let Some(timeout_ms) = timeout_ms {
                config.timeouts.response_ms = timeout_ms;
            }
            run_send(config, session, document, single).await
        }
        Commands::Ports {
            count,
            base,
            host,
            probe,
        } => {
            let config = OrchestratorConfig::load_or_default(&config_path)?;
            run_ports(&config, count, base, host, probe)
        }
        Commands::Config { save } => {
            let config = OrchestratorConfig::load_or_default(&config_path)?;
            if save {
                config.save(&config_path)?;
                tracing::info!(path = %config_path.display(), "configuration saved");
            }
            let text = toml::to_string_pretty(&config).map_err(ConfigError::from)?;
            print!("{text}");
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "svcd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "svcd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_worker(endpoint: PathBuf) -> Result<(), CliError> {
    tracing::info!(endpoint = %endpoint.display(), "worker starting");
    let mut handler = EchoHandler;
    match worker::run(&endpoint, &mut handler).await? {
        ServeEnd::Exit => tracing::info!("worker exiting on request"),
        ServeEnd::Disconnected => tracing::info!("supervisor went away, worker exiting"),
    }
    Ok(())
}

async fn run_send(
    config: OrchestratorConfig,
    session: String,
    document: String,
    single: bool,
) -> Result<(), CliError> {
    let document: serde_json::Value = serde_json::from_str(&document)?;

    let mut supervisor_config = SupervisorConfig::from_config(&config, session);
    if supervisor_config.executable.is_none() && !supervisor_config.is_test_worker() {
        supervisor_config.executable = Some(std::env::current_exe()?);
        supervisor_config.args = vec!["worker".to_string()];
    }

    // The supervisor API blocks; keep it off the async workers.
    let reply = tokio::task::spawn_blocking(move || {
        let supervisor = SubprocessSupervisor::new(supervisor_config);
        let reply = if single {
            match supervisor.send_single_request(&document) {
                Ok(text) => ReturnMessage::from_json(&text),
                Err(e) => ReturnMessage::failed(e.to_string()),
            }
        } else {
            supervisor.execute(&document)
        };
        supervisor.shutdown();
        reply
    })
    .await?;

    println!("{reply}");
    if reply.is_ok() {
        Ok(())
    } else {
        Err(CliError::RequestFailed(reply.what().to_string()))
    }
}

fn run_ports(
    config: &OrchestratorConfig,
    count: usize,
    base: Option<u16>,
    host: Option<IpAddr>,
    probe: bool,
) -> Result<(), CliError> {
    let mut allocator = PortAllocator::with_base(base.unwrap_or(config.ports.base))?;
    allocator.set_host(host.unwrap_or(config.ports.host));
    allocator.set_probe(probe || config.ports.probe);
    for _ in 0..count {
        println!("{}", allocator.allocate()?);
    }
    Ok(())
}
