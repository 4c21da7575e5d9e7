mod catalog;
mod config;
mod error;
mod host;
mod http;
mod ports;
mod registry;
mod service;
#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cluster::{DockerApi, IpNeigh, QemuImg, Socat, Virsh, VmStack};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::catalog::YamlCatalog;
use crate::config::Cli;
use crate::host::SysinfoProbe;
use crate::ports::PortPool;
use crate::service::Service;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),

    #[error("container runtime error: {0}")]
    Docker(#[from] cluster::DockerEnvError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("error: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match serve(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli) -> std::io::Result<()> {
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn serve(cli: Cli) -> Result<(), StartupError> {
    config::validate(&cli).await?;
    debug!(
        default_bridge = %cli.vm_default_bridge,
        secret_key_set = !cli.secret_key.is_empty(),
        "operator-layer settings loaded"
    );

    let catalog = YamlCatalog::load(&cli.catalog, &cli.vm_templates_path).await?;
    let runtime = Arc::new(DockerApi::connect()?);
    let vm_stack = VmStack {
        hypervisor: Arc::new(Virsh::new(Some(cli.libvirt_client.clone()))),
        overlays: Arc::new(QemuImg),
        forwarder: Arc::new(Socat),
        neighbors: Arc::new(IpNeigh),
    };

    let ports = PortPool::new(cli.env_ports_begin..cli.env_ports_end);
    info!(free_ports = ports.free_count(), "port pool initialized");

    let service = Service::new(
        cli.service_config(),
        Arc::new(catalog),
        ports,
        runtime,
        vm_stack,
        Arc::new(SysinfoProbe::new()),
    );

    let addr = SocketAddr::new(cli.host_api, cli.port_api);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "control api listening");

    axum::serve(listener, http::router(service)).await?;
    Ok(())
}
