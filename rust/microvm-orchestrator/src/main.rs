use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use microvm_orchestrator::channel::{AgentChannel, AgentChannelSettings, ControlPlaneServer, ServerSettings};
use microvm_orchestrator::config::{Config, DriverKind};
use microvm_orchestrator::driver::{FirecrackerDriver, HypervisorDriver, SimulatedDriver};
use microvm_orchestrator::resources::HostResources;
use microvm_orchestrator::tracing as trace_mod;
use microvm_orchestrator::{
    AgentRuntime, AuthorizationGateway, ControlPlane, ControlPlaneSettings, HttpPermissionOracle, RuntimeSettings,
};

#[derive(Debug, Parser)]
#[command(name = "microvm-orchestrator", version, about = "MicroVM orchestration agent and control plane")]
struct Cli {
    /// YAML configuration file; environment variables override its values
    #[arg(long, global = true, env = "ORCHESTRATOR_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Run the host agent
    Agent {
        #[arg(long)]
        agent_id: Option<String>,
        /// Control plane channel address (host:port)
        #[arg(long)]
        control_plane: Option<String>,
        #[arg(long)]
        simulated: bool,
    },
    /// Run the control plane
    ControlPlane {
        /// Channel listen address (host:port)
        #[arg(long)]
        listen: Option<String>,
    },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Agent { .. } => "agent",
            Role::ControlPlane { .. } => "control-plane",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = trace_mod::init_tracing(cli.role.name()) {
        eprintln!("Failed to initialize tracing: {e}");
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    if config.metrics.enabled {
        let metrics_port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = microvm_orchestrator::metrics::start_metrics_server(metrics_port).await {
                error!("Failed to start metrics server: {}", e);
            }
        });
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    let result = match cli.role {
        Role::Agent {
            agent_id,
            control_plane,
            simulated,
        } => {
            if let Some(agent_id) = agent_id {
                config.agent.agent_id = agent_id;
            }
            if let Some(addr) = control_plane {
                config.agent.control_plane_addr = addr;
            }
            if simulated {
                config.agent.driver = DriverKind::Simulated;
            }
            run_agent(&config, shutdown).await
        }
        Role::ControlPlane { listen } => {
            if let Some(addr) = listen {
                config.control_plane.listen_addr = addr;
            }
            run_control_plane(&config, shutdown).await
        }
    };

    trace_mod::shutdown_tracing();
    result
}

async fn run_agent(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let driver: Arc<dyn HypervisorDriver> = match config.agent.driver {
        DriverKind::Firecracker => Arc::new(FirecrackerDriver::new(config.firecracker.clone())),
        DriverKind::Simulated => Arc::new(SimulatedDriver::new(config.firecracker.clone())),
    };
    let host = HostResources::new(config.agent.capacity);
    let (runtime, updates) = AgentRuntime::new(RuntimeSettings::from_config(config), host, driver);
    let runtime = Arc::new(runtime);

    info!(
        agent_id = runtime.agent_id(),
        control_plane = %config.agent.control_plane_addr,
        "Starting agent"
    );

    let monitor = tokio::spawn(Arc::clone(&runtime).run_monitor(
        Duration::from_millis(config.agent.monitor_interval_ms.max(1)),
        shutdown.clone(),
    ));

    let channel = AgentChannel::new(runtime, AgentChannelSettings::from_config(config));
    channel.run(updates, shutdown).await.context("Control channel failed")?;
    monitor.await.context("Monitor task panicked")?;
    Ok(())
}

async fn run_control_plane(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let oracle = HttpPermissionOracle::new(&config.authorization)?;
    let gateway = AuthorizationGateway::new(Arc::new(oracle), config.oracle_timeout());
    let control_plane = Arc::new(ControlPlane::new(ControlPlaneSettings::from_config(config), gateway));

    let sweeper = tokio::spawn(Arc::clone(&control_plane).run_sweeper(
        Duration::from_millis(config.control_plane.sweep_interval_ms.max(1)),
        shutdown.clone(),
    ));

    let listener = TcpListener::bind(&config.control_plane.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.control_plane.listen_addr))?;
    info!(
        addr = %config.control_plane.listen_addr,
        oracle = %config.authorization.oracle_url,
        "Starting control plane"
    );

    let server = Arc::new(ControlPlaneServer::new(control_plane, ServerSettings::from_config(config)));
    server.serve(listener, shutdown).await?;
    sweeper.await.context("Sweeper task panicked")?;
    Ok(())
}
