use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::service::ServiceConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{label} is not a directory: {path}")]
    NotADirectory { label: &'static str, path: String },

    #[error("log file directory does not exist: {0}")]
    MissingLogDirectory(String),

    #[error("ENV_PORTS_BEGIN ({begin}) must be below ENV_PORTS_END ({end})")]
    EmptyPortRange { begin: u16, end: u16 },
}

/// Daemon configuration. Every setting is a flag with an environment
/// fallback, so deployments can configure the process either way.
#[derive(Debug, Parser)]
#[command(name = "venvd", version, about = "Ephemeral environment orchestrator")]
pub struct Cli {
    /// Shared secret for the operator tooling layered on top of the API.
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// Verbose logging by default (RUST_LOG still wins).
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Address the control API binds to.
    #[arg(long, env = "HOST_API")]
    pub host_api: IpAddr,

    /// Port the control API binds to.
    #[arg(long, env = "PORT_API")]
    pub port_api: u16,

    /// Hypervisor connection URI (e.g. qemu:///system).
    #[arg(long, env = "LIBVIRT_CLIENT")]
    pub libvirt_client: String,

    /// Bridge VM templates attach to when authored outside a cluster.
    #[arg(long, env = "VM_DEFAULT_BRIDGE")]
    pub vm_default_bridge: String,

    /// First host port handed to environments (inclusive).
    #[arg(long, env = "ENV_PORTS_BEGIN")]
    pub env_ports_begin: u16,

    /// One past the last host port handed to environments (exclusive).
    #[arg(long, env = "ENV_PORTS_END")]
    pub env_ports_end: u16,

    /// Directory holding per-VM overlay images.
    #[arg(long, env = "VM_OVERLAYS_PATH")]
    pub vm_overlays_path: PathBuf,

    /// Directory holding domain XML templates.
    #[arg(long, env = "VM_TEMPLATES_PATH")]
    pub vm_templates_path: PathBuf,

    /// Directory holding read-only VM base images.
    #[arg(long, env = "VM_BASE_IMAGES_PATH")]
    pub vm_base_images_path: PathBuf,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "LOG_FILE_PATH")]
    pub log_file_path: Option<PathBuf>,

    /// Seconds between VM boot-status polls.
    #[arg(long, env = "ENV_BOOT_POLL_INTERVAL")]
    pub env_boot_poll_interval: u64,

    /// Seconds a VM may stay in booting before it is destroyed.
    #[arg(long, env = "VM_BOOT_TIMEOUT")]
    pub vm_boot_timeout: u64,

    /// Session time-to-live in seconds.
    #[arg(long, env = "CLUSTER_TTL_SECONDS")]
    pub cluster_ttl_seconds: u64,

    /// Minimum session age in seconds before a TTL extension is allowed
    /// (0 disables the gate).
    #[arg(long, env = "CLUSTER_TTL_ALLOW_EXTEND_TIME_SECONDS")]
    pub cluster_ttl_allow_extend_time_seconds: u64,

    /// Seconds added per TTL extension (0 disables extensions).
    #[arg(long, env = "CLUSTER_TTL_EXTEND_SECONDS")]
    pub cluster_ttl_extend_seconds: u64,

    /// Seconds between TTL sweeper runs.
    #[arg(long, env = "CLUSTER_TTL_POLL_SECONDS")]
    pub cluster_ttl_poll_seconds: u64,

    /// Cluster definition catalog (YAML).
    #[arg(long, env = "CATALOG_PATH")]
    pub catalog: PathBuf,
}

impl Cli {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            ttl: Duration::from_secs(self.cluster_ttl_seconds),
            ttl_poll_interval: Duration::from_secs(self.cluster_ttl_poll_seconds),
            ttl_extend: Duration::from_secs(self.cluster_ttl_extend_seconds),
            ttl_allow_extend_after: Duration::from_secs(self.cluster_ttl_allow_extend_time_seconds),
            boot_poll_interval: Duration::from_secs(self.env_boot_poll_interval),
            boot_timeout: Duration::from_secs(self.vm_boot_timeout),
            overlays_dir: self.vm_overlays_path.clone(),
            base_images_dir: self.vm_base_images_path.clone(),
        }
    }
}

async fn check_dir(path: &Path, label: &'static str) -> Result<(), ConfigError> {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(ConfigError::NotADirectory {
            label,
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Validate directory-valued settings and the port range before any
/// resources are touched.
pub async fn validate(cli: &Cli) -> Result<(), ConfigError> {
    check_dir(&cli.vm_overlays_path, "VM_OVERLAYS_PATH").await?;
    check_dir(&cli.vm_templates_path, "VM_TEMPLATES_PATH").await?;
    check_dir(&cli.vm_base_images_path, "VM_BASE_IMAGES_PATH").await?;

    if let Some(log_path) = &cli.log_file_path
        && let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        let exists = tokio::fs::metadata(parent)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !exists {
            return Err(ConfigError::MissingLogDirectory(
                parent.display().to_string(),
            ));
        }
    }

    if cli.env_ports_begin >= cli.env_ports_end {
        return Err(ConfigError::EmptyPortRange {
            begin: cli.env_ports_begin,
            end: cli.env_ports_end,
        });
    }

    Ok(())
}
