use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hostgrid::config::{FileConfig, OrchestratorConfig};
use hostgrid::dashboard::{run_dashboard, DashboardState};
use hostgrid::metrics::{MetricsSink, PrometheusSink};
use hostgrid::orchestrator::Orchestrator;
use hostgrid::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "hostgrid")]
#[command(version)]
#[command(about = "Dispatches jobs to remote worker hosts by host group")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator
    ///
    /// Hosts connect and register, and the status endpoints are served, but
    /// the job stores start empty and nothing here creates jobs. To dispatch
    /// real work, embed the library and build the orchestrator with
    /// `Orchestrator::new` over your own `JobStore` implementations.
    Server(ServerArgs),

    /// Load and validate a configuration file, then exit
    CheckConfig {
        /// Path to the TOML configuration file
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port for the HTTP server and host connections (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Host group to accept and give a job worker; repeatable
    #[arg(long = "host-group")]
    host_groups: Vec<String>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<OrchestratorConfig, Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::default();
    match path {
        Some(path) => Ok(config.apply_file(FileConfig::load(path)?)?),
        None => Ok(config),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(port) = args.port {
        config.listen_addr = SocketAddr::new(config.listen_addr.ip(), port);
    }
    for group in args.host_groups {
        if !config.host_groups.contains(&group) {
            config = config.with_host_group(group);
        }
    }
    if args.no_metrics {
        config.metrics_enabled = false;
    }
    config.validate()?;

    let prometheus = if config.metrics_enabled {
        Some(Arc::new(PrometheusSink::new()?))
    } else {
        None
    };
    let sink = prometheus.clone().map(|p| p as Arc<dyn MetricsSink>);

    let listen_addr = config.listen_addr;
    tracing::info!(
        listen_addr = %listen_addr,
        host_groups = ?config.host_groups,
        tasks = config.tasks.len(),
        metrics = config.metrics_enabled,
        "Starting hostgrid"
    );

    let orchestrator = Arc::new(Orchestrator::in_memory(config, sink)?);
    orchestrator.recover().await?;

    let shutdown = install_shutdown_handler();
    let state = DashboardState {
        orchestrator: orchestrator.clone(),
        metrics: prometheus,
    };
    let ticks = tokio::spawn(orchestrator.run(shutdown.clone()));

    run_dashboard(listen_addr, state, shutdown.clone()).await;
    shutdown.cancel();
    ticks.await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            config.validate()?;
            println!(
                "ok: {} host group(s), {} worker(s), {} task(s), listening on {}",
                config.host_groups.len(),
                config.workers.len(),
                config.tasks.len(),
                config.listen_addr
            );
        }
    }

    Ok(())
}
